use crate::process::ProcessSpawner;
use crate::tunnel::RelayTarget;
use crate::verifier::CredentialVerifier;
use std::sync::Arc;
use std::time::Duration;

/// Per-connection resource limits.
#[derive(Debug, Clone)]
pub struct Limits {
  /// Version exchange, key exchange and authentication must all finish within
  /// this long.
  pub handshake_timeout: Duration,

  /// Channel opens beyond this many concurrently open channels are refused.
  pub max_channels: usize,

  /// Kill `exec` processes still running after this long. Shells are never
  /// time-bounded.
  pub exec_timeout: Option<Duration>,
}

impl Default for Limits {
  fn default() -> Self {
    Self {
      handshake_timeout: Duration::from_secs(30),
      max_channels: 64,
      exec_timeout: None,
    }
  }
}

/// Everything a connection needs from the outside world. Built once at startup
/// and shared read-only between all connections.
pub struct Gateway {
  pub ssh_config: Arc<russh::server::Config>,
  pub verifier: CredentialVerifier,
  pub relay: Arc<RelayTarget>,
  pub spawner: Arc<ProcessSpawner>,
  pub limits: Limits,
}
