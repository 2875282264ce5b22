pub mod client;
pub mod handler;
pub mod hub;
pub mod presence;
pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use client::Client;
use protocol::Frame;

#[derive(Debug, thiserror::Error)]
#[error("{hub}: {remaining} connection(s) still open after shutdown deadline")]
pub struct ShutdownError {
    pub hub: &'static str,
    pub remaining: usize,
}

/// Close every client (after an optional parting frame) and wait for their
/// write pumps to exit, bounded by `timeout`.
pub(crate) async fn shutdown_clients(
    hub: &'static str,
    clients: Vec<Arc<Client>>,
    parting: Option<Frame>,
    timeout: Duration,
) -> Result<(), ShutdownError> {
    tracing::info!(hub, clients = clients.len(), "Shutting down hub");
    for client in &clients {
        if let Some(frame) = &parting {
            client.try_send(frame.clone());
        }
        client.close();
    }

    let waits = clients.iter().map(|c| c.closed());
    match tokio::time::timeout(timeout, join_all(waits)).await {
        Ok(_) => Ok(()),
        Err(_) => {
            let remaining = clients.iter().filter(|c| !c.has_exited()).count();
            tracing::warn!(hub, remaining, "Shutdown deadline exceeded");
            Err(ShutdownError { hub, remaining })
        }
    }
}
