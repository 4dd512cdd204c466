//! Server-server API response and request bodies.
//!
//! Shared by the mock federation peer and the simulated homeserver so both
//! sides agree on one shape. Only the fields the scenarios exercise are
//! modelled.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Event, ProtoEvent};
use crate::ids::{EventId, RoomVersion, ServerName};

/// `GET /_matrix/federation/v1/state_ids/{roomId}?event_id=`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespStateIds {
    pub pdu_ids: Vec<EventId>,
    pub auth_chain_ids: Vec<EventId>,
}

/// `GET /_matrix/federation/v1/state/{roomId}?event_id=`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespState {
    pub pdus: Vec<Event>,
    pub auth_chain: Vec<Event>,
}

/// `GET /_matrix/federation/v1/make_join/{roomId}/{userId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespMakeJoin {
    pub room_version: RoomVersion,
    pub event: ProtoEvent,
}

/// `PUT /_matrix/federation/v2/send_join/{roomId}/{eventId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespSendJoin {
    pub origin: ServerName,
    pub state: Vec<Event>,
    pub auth_chain: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    #[serde(default)]
    pub members_omitted: bool,
    #[serde(default)]
    pub servers_in_room: Vec<ServerName>,
}

/// `GET /_matrix/federation/v1/event/{eventId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespEvent {
    pub origin: ServerName,
    pub origin_server_ts: i64,
    pub pdus: Vec<Event>,
}

/// `GET /_matrix/federation/v1/event_auth/{roomId}/{eventId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespEventAuth {
    pub auth_chain: Vec<Event>,
}

/// `PUT /_matrix/federation/v1/send/{txnId}`
///
/// PDUs stay raw so a receiver can reject one malformed entry without
/// dropping the whole transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub origin: ServerName,
    pub origin_server_ts: i64,
    #[serde(default)]
    pub pdus: Vec<Value>,
    #[serde(default)]
    pub edus: Vec<Value>,
}

/// `Authorization` header value identifying the requesting server.
///
/// Requests are not signed; the header only carries the origin.
pub fn x_matrix_authorization(origin: &ServerName) -> String {
    format!("X-Matrix origin=\"{}\"", origin)
}

/// Extract the origin from an `X-Matrix` authorization header.
pub fn parse_x_matrix_origin(header: &str) -> Option<ServerName> {
    let params = header.trim().strip_prefix("X-Matrix")?.trim();
    params.split(',').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        (key.trim() == "origin").then(|| ServerName::from(value.trim().trim_matches('"')))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x_matrix_origin_roundtrip_with_port() {
        let origin = ServerName::from("127.0.0.1:38211");
        let header = x_matrix_authorization(&origin);

        assert_eq!(parse_x_matrix_origin(&header), Some(origin));
    }

    #[test]
    fn test_x_matrix_origin_among_other_params() {
        let header = r#"X-Matrix key="ed25519:1",origin="hs2",sig="abc""#;
        assert_eq!(parse_x_matrix_origin(header), Some(ServerName::from("hs2")));
        assert_eq!(parse_x_matrix_origin("Bearer token"), None);
    }

    #[test]
    fn test_empty_object_is_not_a_state_ids_response() {
        assert!(serde_json::from_str::<RespStateIds>("{}").is_err());
    }
}
