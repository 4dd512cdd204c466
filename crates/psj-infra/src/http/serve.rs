use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serve `router` on `listener` until `shutdown` is cancelled.
///
/// Shutdown is graceful: in-flight requests finish, so handlers that block
/// must observe the same token.
pub fn spawn_server(
    name: &str,
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<SocketAddr> {
    let addr = listener
        .local_addr()
        .context("listener has no local address")?;
    let name = name.to_string();
    tokio::spawn(async move {
        tracing::debug!(server = %name, %addr, "listening");
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        match result {
            Ok(()) => tracing::debug!(server = %name, %addr, "listener stopped"),
            Err(err) => tracing::warn!(server = %name, %addr, error = %err, "listener failed"),
        }
    });
    Ok(addr)
}
