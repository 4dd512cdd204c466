/// A homeserver and the users registered on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeserverBlueprint {
    pub name: &'static str,
    pub users: Vec<&'static str>,
}

/// Which homeservers a deployment starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blueprint {
    pub name: &'static str,
    pub homeservers: Vec<HomeserverBlueprint>,
}

impl Blueprint {
    /// `hs1` with `@alice:hs1`.
    pub fn alice() -> Self {
        Self {
            name: "alice",
            homeservers: vec![HomeserverBlueprint {
                name: "hs1",
                users: vec!["alice"],
            }],
        }
    }

    /// `hs1` with alice and bob, `hs2` with charlie. The "remote" is the
    /// scenario's mock peer.
    pub fn federation_two_local_one_remote() -> Self {
        Self {
            name: "federation_two_local_one_remote",
            homeservers: vec![
                HomeserverBlueprint {
                    name: "hs1",
                    users: vec!["alice", "bob"],
                },
                HomeserverBlueprint {
                    name: "hs2",
                    users: vec!["charlie"],
                },
            ],
        }
    }
}
