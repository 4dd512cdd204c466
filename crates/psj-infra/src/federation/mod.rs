//! Mock federation peer
//!
//! A [`Server`] is an HTTP endpoint speaking just enough of the server-server
//! API for a scenario: stock handlers come from [`handlers`], and scenarios
//! add their own routes through [`Server::mux`].

pub mod handlers;
mod mux;
mod room;
mod server;

pub use handlers::{
    handle_event_auth_requests, handle_event_requests, handle_key_requests,
    handle_partial_state_make_send_join_requests, handle_transaction_requests, EduCallback,
    PduCallback,
};
pub use mux::{decode_path, FederationRequest, Handler, Mux, RouteBuilder};
pub use room::ServerRoom;
pub use server::{CancelListener, Rooms, Server, ServerOption};
