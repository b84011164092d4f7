use crate::dispatcher::ConnectionHandler;
use crate::gateway::Gateway;
use russh::Disconnect;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// After a handshake timeout, how long the peer gets to receive the disconnect
/// before the socket is dropped.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Runs one raw connection through the SSH handshake and then for as long as
/// the transport lives. Never returns an error: every failure here is local to
/// this connection and only logged.
pub async fn negotiate(gateway: Arc<Gateway>, stream: TcpStream, client_address: SocketAddr, client_id: Uuid) {
  let span = tracing::Span::current();
  let deadline = Instant::now() + gateway.limits.handshake_timeout;
  let (authenticated_tx, authenticated_rx) = oneshot::channel();
  let handler = ConnectionHandler::new(gateway.clone(), client_id, client_address, span, authenticated_tx);
  let channels = handler.channels();

  // `run_stream` performs the version exchange before returning.
  let running = russh::server::run_stream(gateway.ssh_config.clone(), stream, handler);
  let session = match tokio::time::timeout_at(deadline, running).await {
    Ok(Ok(session)) => session,
    Ok(Err(error)) => {
      tracing::info!(?error, "handshake failed");
      return;
    }
    Err(_) => {
      tracing::warn!("handshake timed out during version exchange");
      return;
    }
  };
  let handle = session.handle();
  tokio::pin!(session);

  let outcome = tokio::select! {
    outcome = &mut session => {
      tracing::info!(?outcome, "connection closed before authentication");
      return;
    }
    authenticated = tokio::time::timeout_at(deadline, authenticated_rx) => authenticated,
  };

  match outcome {
    Ok(Ok(identity)) => tracing::info!(%identity, "handshake complete"),
    // The handler is gone, so the session is finishing on its own.
    Ok(Err(_)) => {}
    Err(_) => {
      tracing::warn!(timeout = ?gateway.limits.handshake_timeout, "handshake timed out; disconnecting");
      if let Err(error) = handle
        .disconnect(Disconnect::ByApplication, "handshake timed out".into(), "en".into())
        .await
      {
        tracing::debug!(?error, "sending disconnect failed");
      }
      if tokio::time::timeout(DISCONNECT_GRACE, &mut session).await.is_err() {
        tracing::debug!("session still running after disconnect");
      }
      return;
    }
  }

  match session.await {
    Ok(()) => tracing::info!(open_channels = channels.len(), "connection closed"),
    Err(error) => tracing::info!(?error, open_channels = channels.len(), "connection ended with error"),
  }
}
