use std::net::SocketAddr;

use crate::ids::ServerName;

/// Resolves server names to listening addresses.
///
/// Deployments register logical names (`hs1`, `hs2`); names that already are
/// socket addresses, like a mock peer's `127.0.0.1:port`, resolve to
/// themselves.
pub trait ServerDirectory: Send + Sync {
    /// Address for a registered logical name.
    fn lookup(&self, server_name: &ServerName) -> Option<SocketAddr>;

    fn resolve(&self, server_name: &ServerName) -> Option<SocketAddr> {
        self.lookup(server_name)
            .or_else(|| server_name.as_str().parse().ok())
    }

    fn base_url(&self, server_name: &ServerName) -> Option<String> {
        self.resolve(server_name)
            .map(|addr| format!("http://{}", addr))
    }
}
