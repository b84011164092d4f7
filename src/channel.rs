//! Channel bookkeeping shared by the dispatcher and the channel handlers.

use crate::session::SessionRequest;
use dashmap::DashMap;
use russh::ChannelId;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The kind a peer declared when opening a channel, decided once at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
  /// `session`: remote `shell` / `exec`.
  Session,
  /// `forwarded-tcpip`: relayed to the configured local endpoint.
  Tunnel,
  /// Anything else. Carries the wire name for logging.
  Unsupported(&'static str),
}

/// Lifecycle of a channel once it has been accepted. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelState {
  Opened,
  Active,
  Closing,
  Closed,
}

pub struct ChannelSlot {
  pub kind: ChannelKind,
  pub state: ChannelState,

  /// Queue into the session handler task. `None` for tunnel channels.
  requests: Option<mpsc::UnboundedSender<SessionRequest>>,

  /// Set once a `shell` or `exec` has been granted on this channel. Never
  /// cleared: a session channel runs at most one process in its lifetime.
  process_bound: bool,
}

/// The open channels of one connection, keyed by russh's [`ChannelId`].
pub type ChannelSet<K = ChannelId> = Arc<DashMap<K, ChannelSlot>>;

pub fn new_channel_set<K: Eq + Hash>() -> ChannelSet<K> {
  Arc::new(DashMap::new())
}

/// Outcome of asking to bind a process to a channel.
#[derive(Debug)]
pub enum ProcessClaim {
  /// The caller now owns the channel's one process slot.
  Granted(mpsc::UnboundedSender<SessionRequest>),
  AlreadyBound,
  /// A tunnel channel, or one that is already gone.
  NotASession,
}

pub fn claim_process<K: Eq + Hash>(channels: &ChannelSet<K>, channel_id: K) -> ProcessClaim {
  let Some(mut slot) = channels.get_mut(&channel_id) else {
    return ProcessClaim::NotASession;
  };
  if slot.kind != ChannelKind::Session || slot.state >= ChannelState::Closing {
    return ProcessClaim::NotASession;
  }
  let Some(requests) = slot.requests.clone() else {
    return ProcessClaim::NotASession;
  };
  if slot.process_bound {
    return ProcessClaim::AlreadyBound;
  }
  slot.process_bound = true;
  ProcessClaim::Granted(requests)
}

/// A handler's membership in its connection's [`ChannelSet`].
///
/// Dropping the guard marks the channel `Closed` and removes it from the set, so
/// the set shrinks on every exit path of a handler task.
pub struct ChannelGuard<K: Copy + Eq + Hash + Debug = ChannelId> {
  channels: ChannelSet<K>,
  channel_id: K,
}

impl<K: Copy + Eq + Hash + Debug> ChannelGuard<K> {
  /// Registers a freshly accepted channel in state `Opened`.
  pub fn register(
    channels: &ChannelSet<K>,
    channel_id: K,
    kind: ChannelKind,
    requests: Option<mpsc::UnboundedSender<SessionRequest>>,
  ) -> Self {
    // russh never reuses a channel id while it's open on the same connection.
    channels.insert(
      channel_id,
      ChannelSlot {
        kind,
        state: ChannelState::Opened,
        requests,
        process_bound: false,
      },
    );
    Self {
      channels: channels.clone(),
      channel_id,
    }
  }

  pub fn state(&self) -> Option<ChannelState> {
    self.channels.get(&self.channel_id).map(|slot| slot.state)
  }

  pub fn advance(&self, next: ChannelState) {
    if let Some(mut slot) = self.channels.get_mut(&self.channel_id) {
      if next > slot.state {
        tracing::debug!(channel_id = ?self.channel_id, from = ?slot.state, to = ?next, "channel state");
        slot.state = next;
      }
    }
  }
}

impl<K: Copy + Eq + Hash + Debug> Drop for ChannelGuard<K> {
  fn drop(&mut self) {
    self.advance(ChannelState::Closed);
    self.channels.remove(&self.channel_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn guard_releases_slot_on_drop() {
    let channels = new_channel_set();
    let guard = ChannelGuard::register(&channels, 1u32, ChannelKind::Tunnel, None);
    assert_eq!(channels.len(), 1);
    assert_eq!(guard.state(), Some(ChannelState::Opened));
    drop(guard);
    assert!(channels.is_empty());
  }

  #[test]
  fn states_only_move_forward() {
    let channels = new_channel_set();
    let guard = ChannelGuard::register(&channels, 7u32, ChannelKind::Tunnel, None);
    guard.advance(ChannelState::Active);
    guard.advance(ChannelState::Closing);
    guard.advance(ChannelState::Active);
    assert_eq!(guard.state(), Some(ChannelState::Closing));
  }

  #[test]
  fn one_process_per_session_channel() {
    let channels = new_channel_set();
    let (requests, _receiver) = mpsc::unbounded_channel();
    let _guard = ChannelGuard::register(&channels, 2u32, ChannelKind::Session, Some(requests));

    assert!(matches!(claim_process(&channels, 2u32), ProcessClaim::Granted(_)));
    assert!(matches!(
      claim_process(&channels, 2u32),
      ProcessClaim::AlreadyBound
    ));
  }

  #[test]
  fn tunnels_and_unknown_channels_cannot_run_processes() {
    let channels = new_channel_set();
    let _guard = ChannelGuard::register(&channels, 3u32, ChannelKind::Tunnel, None);
    assert!(matches!(
      claim_process(&channels, 3u32),
      ProcessClaim::NotASession
    ));
    assert!(matches!(
      claim_process(&channels, 99u32),
      ProcessClaim::NotASession
    ));
  }

  #[test]
  fn closing_channels_cannot_run_processes() {
    let channels = new_channel_set();
    let (requests, _receiver) = mpsc::unbounded_channel();
    let guard = ChannelGuard::register(&channels, 4u32, ChannelKind::Session, Some(requests));
    guard.advance(ChannelState::Closing);
    assert!(matches!(
      claim_process(&channels, 4u32),
      ProcessClaim::NotASession
    ));
  }
}
