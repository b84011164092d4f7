use crate::gateway::Gateway;
use crate::negotiator::negotiate;
use anyhow::Context;
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::Instrument;
use uuid::Uuid;

/// Pause after a failed `accept`, eg when the process is out of file
/// descriptors, so the loop doesn't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Binds every address. Any failure fails the whole bind.
pub async fn bind(addresses: &[SocketAddr]) -> anyhow::Result<Vec<TcpListener>> {
  tracing::debug!(?addresses, "binding to sockets");
  join_all(addresses.iter().map(TcpListener::bind))
    .await
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .context("failed to bind sockets")
}

/// Accepts connections forever, one negotiation task per connection.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) {
  tracing::info!(local_address = ?listener.local_addr().ok(), "listening");
  loop {
    match listener.accept().await {
      Ok((stream, client_address)) => {
        let client_id = Uuid::new_v4();
        let span = tracing::info_span!("connection", ?client_id, %client_address);
        span.in_scope(|| tracing::info!("connection accepted"));
        if let Err(error) = stream.set_nodelay(true) {
          tracing::debug!(?error, "setting TCP_NODELAY failed");
        }
        tokio::spawn(negotiate(gateway.clone(), stream, client_address, client_id).instrument(span));
      }
      // Accept errors are about one connection (or a transient resource
      // shortage), never about the listening socket itself.
      Err(error) => {
        tracing::warn!(?error, "accept failed");
        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn binds_every_address() {
    let addresses = ["127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap()];
    let listeners = bind(&addresses).await.unwrap();
    assert_eq!(listeners.len(), 2);
  }

  #[tokio::test]
  async fn bind_conflict_is_an_error() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = taken.local_addr().unwrap();
    assert!(bind(&[address]).await.is_err());
  }
}
