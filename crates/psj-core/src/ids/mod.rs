//! ID type wrappers for type safety.
//!
//! Matrix identifiers are sigil-prefixed strings (`@user:server`,
//! `!room:server`, `$event`). The wrappers keep them from being mixed up
//! when they flow through handlers and stores.

mod id_macro;

use id_macro::impl_id;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier {0:?} does not start with {1:?}")]
    MissingSigil(String, char),

    #[error("identifier {0:?} has no server part")]
    MissingServer(String),
}

/// Name of a federating server, e.g. `hs1` or `127.0.0.1:40123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerName(String);

/// Fully qualified user id, `@localpart:server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// Room id, `!opaque:server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

/// Event id, `$reference-hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

/// Room version string as advertised by `/capabilities`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomVersion(String);

impl_id!(ServerName, UserId, RoomId, EventId, RoomVersion);

impl UserId {
    pub fn new(localpart: &str, server: &ServerName) -> Self {
        Self(format!("@{}:{}", localpart, server))
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        let id = Self(s.to_string());
        id.split()?;
        Ok(id)
    }

    pub fn localpart(&self) -> &str {
        self.split().map(|(local, _)| local).unwrap_or("")
    }

    pub fn server_name(&self) -> ServerName {
        self.split()
            .map(|(_, server)| ServerName::from(server))
            .unwrap_or_else(|_| ServerName::from(""))
    }

    fn split(&self) -> Result<(&str, &str), IdError> {
        let rest = self
            .0
            .strip_prefix('@')
            .ok_or_else(|| IdError::MissingSigil(self.0.clone(), '@'))?;
        rest.split_once(':')
            .ok_or_else(|| IdError::MissingServer(self.0.clone()))
    }
}

impl RoomId {
    /// Mint a fresh room id owned by `server`.
    pub fn generate(server: &ServerName) -> Self {
        Self(format!("!{}:{}", uuid::Uuid::new_v4().simple(), server))
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        let rest = s
            .strip_prefix('!')
            .ok_or_else(|| IdError::MissingSigil(s.to_string(), '!'))?;
        if !rest.contains(':') {
            return Err(IdError::MissingServer(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl Default for RoomVersion {
    fn default() -> Self {
        Self("10".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_parts_with_port_in_server_name() {
        let server = ServerName::from("127.0.0.1:8448");
        let user = UserId::new("charlie", &server);

        assert_eq!(user.as_str(), "@charlie:127.0.0.1:8448");
        assert_eq!(user.localpart(), "charlie");
        assert_eq!(user.server_name(), server);
    }

    #[test]
    fn test_user_id_parse_rejects_missing_sigil() {
        assert_eq!(
            UserId::parse("alice:hs1"),
            Err(IdError::MissingSigil("alice:hs1".to_string(), '@'))
        );
        assert!(UserId::parse("@alice").is_err());
    }

    #[test]
    fn test_room_id_generate_is_unique_and_parseable() {
        let server = ServerName::from("hs1");
        let a = RoomId::generate(&server);
        let b = RoomId::generate(&server);

        assert_ne!(a, b);
        assert!(a.as_str().ends_with(":hs1"));
        assert_eq!(RoomId::parse(a.as_str()), Ok(a));
    }
}
