use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use psj_core::ports::ServerDirectory;
use psj_core::ServerName;

/// Where each deployed homeserver currently listens.
///
/// Restarts re-register a server under a new address; everyone resolving
/// through the directory follows along on the next request.
#[derive(Debug, Default)]
pub struct Network {
    addrs: RwLock<HashMap<ServerName, SocketAddr>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server_name: ServerName, addr: SocketAddr) {
        tracing::debug!(server = %server_name, %addr, "registered server address");
        self.addrs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server_name, addr);
    }

    pub fn unregister(&self, server_name: &ServerName) {
        self.addrs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_name);
    }
}

impl ServerDirectory for Network {
    fn lookup(&self, server_name: &ServerName) -> Option<SocketAddr> {
        self.addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_name)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reregistering_moves_the_server() {
        let network = Network::new();
        let hs1 = ServerName::from("hs1");
        network.register(hs1.clone(), "127.0.0.1:4000".parse().unwrap());
        network.register(hs1.clone(), "127.0.0.1:4001".parse().unwrap());

        assert_eq!(
            network.base_url(&hs1).as_deref(),
            Some("http://127.0.0.1:4001")
        );

        network.unregister(&hs1);
        assert_eq!(network.lookup(&hs1), None);
    }
}
