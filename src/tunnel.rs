use crate::channel::{ChannelGuard, ChannelState};
use anyhow::Context;
use russh::server::{Handle, Msg};
use russh::Channel;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// The one local endpoint every `forwarded-tcpip` channel is relayed to.
#[derive(Debug, Clone)]
pub struct RelayTarget {
  /// `host:port`, resolved on every dial.
  pub address: String,
  pub connect_timeout: Duration,
}

impl Default for RelayTarget {
  fn default() -> Self {
    Self {
      address: "localhost:8080".to_owned(),
      connect_timeout: Duration::from_secs(10),
    }
  }
}

impl RelayTarget {
  pub async fn dial(&self) -> anyhow::Result<TcpStream> {
    tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
      .await
      .with_context(|| format!("Timed out connecting to {} after {:?}", self.address, self.connect_timeout))?
      .with_context(|| format!("Failed to connect to {}", self.address))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  ChannelToLocal,
  LocalToChannel,
}

#[derive(Debug)]
pub struct RelayOutcome {
  /// The direction that ended the relay.
  pub finished: Direction,
  /// Bytes copied in that direction, or the error that stopped it.
  pub result: std::io::Result<u64>,
}

/// Copies bytes both ways between `channel` and `local` until either direction
/// reaches EOF or fails. The other direction is dropped mid-flight and both
/// write sides are shut down before returning.
pub async fn relay<C, L>(channel: C, local: L) -> RelayOutcome
where
  C: AsyncRead + AsyncWrite,
  L: AsyncRead + AsyncWrite,
{
  let (mut channel_reader, mut channel_writer) = tokio::io::split(channel);
  let (mut local_reader, mut local_writer) = tokio::io::split(local);

  let outcome = {
    let inbound = tokio::io::copy(&mut channel_reader, &mut local_writer);
    let outbound = tokio::io::copy(&mut local_reader, &mut channel_writer);
    tokio::select! {
      result = inbound => RelayOutcome { finished: Direction::ChannelToLocal, result },
      result = outbound => RelayOutcome { finished: Direction::LocalToChannel, result },
    }
  };

  if let Err(error) = local_writer.shutdown().await {
    tracing::debug!(?error, "shutting down local socket failed");
  }
  // On a russh channel stream this sends EOF.
  if let Err(error) = channel_writer.shutdown().await {
    tracing::debug!(?error, "shutting down channel stream failed");
  }
  outcome
}

/// Serves one `forwarded-tcpip` channel for its whole lifetime.
pub struct TunnelChannel {
  pub channel: Channel<Msg>,
  pub handle: Handle,
  pub guard: ChannelGuard,
  pub target: std::sync::Arc<RelayTarget>,
}

impl TunnelChannel {
  pub async fn serve(self) {
    let TunnelChannel {
      channel,
      handle,
      guard,
      target,
    } = self;
    let channel_id = channel.id();
    let close = move || async move {
      if let Err(error) = handle.close(channel_id).await {
        tracing::debug!(?error, "sending close failed");
      }
    };
    serve_stream(channel.into_stream(), guard, &target, close).await;
  }
}

/// Relays one tunnel channel's `stream` to `target`, then closes the channel
/// with `close`, whether or not the dial succeeded. The channel's slot is
/// released before this returns.
pub async fn serve_stream<K, S, C, F>(stream: S, guard: ChannelGuard<K>, target: &RelayTarget, close: C)
where
  K: Copy + Eq + Hash + Debug,
  S: AsyncRead + AsyncWrite,
  C: FnOnce() -> F,
  F: Future<Output = ()>,
{
  let local = match target.dial().await {
    Ok(local) => local,
    Err(error) => {
      tracing::warn!(?error, target = %target.address, "relay target unreachable, closing channel");
      guard.advance(ChannelState::Closing);
      close().await;
      return;
    }
  };
  tracing::info!(
    target = %target.address,
    local_address = ?local.local_addr().ok(),
    "relay connected"
  );
  guard.advance(ChannelState::Active);

  let outcome = relay(stream, local).await;
  guard.advance(ChannelState::Closing);
  match &outcome.result {
    Ok(bytes) => tracing::info!(finished = ?outcome.finished, bytes, "relay finished"),
    Err(error) => tracing::info!(finished = ?outcome.finished, ?error, "relay failed"),
  }
  close().await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::channel::{new_channel_set, ChannelKind};
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;
  use tokio::sync::oneshot;

  /// A local service that echoes every connection back to itself.
  async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
      loop {
        let (mut socket, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
          let (mut reader, mut writer) = socket.split();
          let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
      }
    });
    address
  }

  fn target(address: String) -> RelayTarget {
    RelayTarget {
      address,
      connect_timeout: Duration::from_secs(2),
    }
  }

  #[tokio::test]
  async fn relays_both_ways() {
    let target = target(echo_server().await);
    let (mut peer, channel_side) = tokio::io::duplex(1024);
    let relay = tokio::spawn(async move { relay(channel_side, target.dial().await.unwrap()).await });

    peer.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    peer.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");

    // Closing our side ends the relay from the channel direction.
    drop(peer);
    let outcome = relay.await.unwrap();
    assert_eq!(outcome.finished, Direction::ChannelToLocal);
    assert_eq!(outcome.result.unwrap(), 4);
  }

  #[tokio::test]
  async fn concurrent_relays_do_not_cross_talk() {
    let target = target(echo_server().await);
    let (mut first, first_channel) = tokio::io::duplex(1024);
    let (mut second, second_channel) = tokio::io::duplex(1024);
    let first_local = target.dial().await.unwrap();
    let second_local = target.dial().await.unwrap();
    let first_relay = tokio::spawn(relay(first_channel, first_local));
    let second_relay = tokio::spawn(relay(second_channel, second_local));

    first.write_all(b"first").await.unwrap();
    second.write_all(b"second").await.unwrap();

    let mut reply = [0u8; 5];
    first.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"first");

    // Tearing down the first pair leaves the second untouched.
    drop(first);
    first_relay.await.unwrap();

    let mut reply = [0u8; 6];
    second.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"second");
    second.write_all(b"again").await.unwrap();
    let mut reply = [0u8; 5];
    second.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"again");

    drop(second);
    second_relay.await.unwrap();
  }

  #[tokio::test]
  async fn local_close_ends_relay_and_sends_eof() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = target(listener.local_addr().unwrap().to_string());
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      socket.write_all(b"bye").await.unwrap();
      // Dropping the socket closes the local side.
    });

    let (mut peer, channel_side) = tokio::io::duplex(1024);
    let outcome = relay(channel_side, target.dial().await.unwrap()).await;
    assert_eq!(outcome.finished, Direction::LocalToChannel);

    let mut received = Vec::new();
    peer.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"bye");
  }

  #[tokio::test]
  async fn unreachable_target_fails_fast() {
    // Bind then drop, so nothing listens on the port.
    let address = {
      let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
      listener.local_addr().unwrap().to_string()
    };
    let started = std::time::Instant::now();
    assert!(target(address).dial().await.is_err());
    assert!(started.elapsed() < Duration::from_secs(2));
  }

  /// An address nothing listens on.
  async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
  }

  #[tokio::test]
  async fn unreachable_target_closes_channel_and_releases_slot() {
    let channels = new_channel_set();
    let guard = ChannelGuard::register(&channels, 1u32, ChannelKind::Tunnel, None);
    let (mut peer, channel_side) = tokio::io::duplex(1024);
    let (closed_tx, mut closed_rx) = oneshot::channel();

    let target = target(closed_port().await);
    serve_stream(channel_side, guard, &target, move || async move {
      closed_tx.send(()).unwrap();
    })
    .await;

    assert!(closed_rx.try_recv().is_ok());
    assert!(channels.is_empty());
    let mut received = Vec::new();
    peer.read_to_end(&mut received).await.unwrap();
    assert!(received.is_empty());
  }

  #[tokio::test]
  async fn finished_relay_closes_channel_and_releases_slot() {
    let channels = new_channel_set();
    let guard = ChannelGuard::register(&channels, 5u32, ChannelKind::Tunnel, None);
    let (mut peer, channel_side) = tokio::io::duplex(1024);
    let (closed_tx, closed_rx) = oneshot::channel();

    let target = target(echo_server().await);
    let served = tokio::spawn(async move {
      serve_stream(channel_side, guard, &target, move || async move {
        closed_tx.send(()).unwrap();
      })
      .await
    });

    peer.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    peer.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");
    assert_eq!(channels.get(&5).map(|slot| slot.state), Some(ChannelState::Active));

    drop(peer);
    served.await.unwrap();
    closed_rx.await.unwrap();
    assert!(channels.is_empty());
  }
}
