use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tunnelgate::{listener, CredentialVerifier, CredentialsFile, Gateway, Limits, ProcessSpawner, RelayTarget};

/// A reverse-access SSH gateway: devices dial in to run commands on this host and
/// to relay TCP connections to a local service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Path to private key files for the host. Can be specified multiple times, and at least one is required.
  #[arg(long, required = true)]
  host_key_path: Vec<PathBuf>,

  /// Addresses to listen on. [default: 0.0.0.0:2000]
  // Default value logic is handled in `main` since it can't be done with
  // multiple values in `Args`.
  #[arg(long)]
  listen: Vec<SocketAddr>,

  /// Password accepted from any device identity.
  #[arg(long, env = "TUNNELGATE_SHARED_SECRET", hide_env_values = true)]
  shared_secret: Option<String>,

  /// JSON file with per-device passwords and authorized keys.
  #[arg(long)]
  credentials_file: Option<PathBuf>,

  /// Local `host:port` that every forwarded-tcpip channel is relayed to.
  #[arg(long, default_value = "localhost:8080")]
  relay_target: String,

  /// Give up dialing the relay target after this long.
  #[arg(long, default_value_t = 10)]
  relay_connect_timeout_seconds: u64,

  /// Program started for `shell` requests.
  #[arg(long, default_value = "/bin/bash")]
  shell: PathBuf,

  /// Program that runs `exec` commands as `<interpreter> -c <command>`.
  #[arg(long, default_value = "sh")]
  interpreter: PathBuf,

  /// Optionally kill `exec` commands that run longer than this.
  #[arg(long)]
  exec_timeout_seconds: Option<u64>,

  /// Drop connections that haven't authenticated within this long.
  #[arg(long, default_value_t = 30)]
  handshake_timeout_seconds: u64,

  /// Maximum number of concurrently open channels per connection.
  #[arg(long, default_value_t = 64)]
  max_channels: usize,

  /// Optionally drop privileges to this user after binding to the socket.
  #[arg(long)]
  setuid: Option<u32>,

  /// Optionally drop privileges to this group after binding to the socket.
  #[arg(long)]
  setgid: Option<u32>,

  /// Optionally send keepalive messages at this interval.
  #[arg(long)]
  keepalive_interval_seconds: Option<u64>,

  /// Close connections after this many unanswered keepalive messages.
  #[arg(long, default_value_t = 3)]
  keepalive_max_unanswered: usize,

  /// Optionally close connections that have been idle for this long.
  #[arg(long)]
  inactivity_timeout_seconds: Option<u64>,
}

fn load_host_keys(paths: &[PathBuf]) -> anyhow::Result<Vec<russh::keys::PrivateKey>> {
  paths
    .iter()
    // NOTE: we don't support encrypted keys or "~/foo" paths yet.
    .map(|path| russh::keys::load_secret_key(path, None).with_context(|| format!("Failed to load host key {}", path.display())))
    .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .pretty()
        // Use span events to automatically log each of the SSH handlers.
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NEW),
    )
    .with(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let args = Args::parse();

  let credentials = match &args.credentials_file {
    Some(path) => CredentialsFile::load(path)?,
    None => CredentialsFile::default(),
  };
  let verifier = CredentialVerifier::new(args.shared_secret.as_deref(), &credentials)?;

  let config = russh::server::Config {
    auth_rejection_time: Duration::from_secs(1),
    auth_rejection_time_initial: Some(Duration::from_secs(0)),
    keys: load_host_keys(&args.host_key_path)?,
    methods: russh::MethodSet::from([russh::MethodKind::Password, russh::MethodKind::PublicKey].as_slice()),
    keepalive_interval: args.keepalive_interval_seconds.map(Duration::from_secs),
    keepalive_max: args.keepalive_max_unanswered,
    inactivity_timeout: args.inactivity_timeout_seconds.map(Duration::from_secs),
    ..Default::default()
  };

  let gateway = Arc::new(Gateway {
    ssh_config: Arc::new(config),
    verifier,
    relay: Arc::new(RelayTarget {
      address: args.relay_target,
      connect_timeout: Duration::from_secs(args.relay_connect_timeout_seconds),
    }),
    spawner: Arc::new(ProcessSpawner {
      shell: args.shell,
      interpreter: args.interpreter,
    }),
    limits: Limits {
      handshake_timeout: Duration::from_secs(args.handshake_timeout_seconds),
      max_channels: args.max_channels,
      exec_timeout: args.exec_timeout_seconds.map(Duration::from_secs),
    },
  });

  let addresses = if args.listen.is_empty() {
    vec![SocketAddr::from(([0, 0, 0, 0], 2000))]
  } else {
    args.listen
  };
  let sockets = listener::bind(&addresses).await?;

  // setgid before setuid, since generally speaking we won't have permission to
  // setgid after setuid.
  if let Some(gid) = args.setgid {
    tracing::info!(gid, "dropping gid privileges");
    nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).context("failed to drop privileges with setgid")?;
  }
  if let Some(uid) = args.setuid {
    tracing::info!(uid, "dropping uid privileges");
    nix::unistd::setuid(nix::unistd::Uid::from_raw(uid)).context("failed to drop privileges with setuid")?;
  }

  tracing::info!(?addresses, relay_target = %gateway.relay.address, "listening on sockets");
  join_all(sockets.into_iter().map(|socket| listener::serve(socket, gateway.clone()))).await;

  Ok(())
}
