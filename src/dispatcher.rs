//! The russh handler for one connection: authentication, channel opens and
//! in-band requests.
//!
//! Flow for a device running a command (eg `ssh -p 2000 sensor-1@gateway uptime`):
//! 1. `auth_password` or `auth_publickey` ask the [`CredentialVerifier`](crate::CredentialVerifier).
//! 2. `channel_open_session` registers the channel and spawns a [`SessionChannel`] task.
//! 3. `exec_request` claims the channel's single process slot, replies on the wire and
//!    hands the command to that task.
//!
//! A `forwarded-tcpip` open skips straight to a [`TunnelChannel`] task. Every other
//! channel type and every request this gateway doesn't serve is refused without
//! blocking the peer.

use crate::channel::{claim_process, new_channel_set, ChannelGuard, ChannelKind, ChannelSet, ProcessClaim};
use crate::gateway::Gateway;
use crate::session::{SessionChannel, SessionRequest};
use crate::tunnel::TunnelChannel;
use crate::verifier::{Credentials, CredentialsType, Verdict};
use russh::keys::PublicKeyBase64;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty, Sig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;
use uuid::Uuid;

/// Written to the error stream when an `exec` payload can't be decoded.
const INVALID_EXEC_DIAGNOSTIC: &str = "Invalid exec request\n";

/// Why a channel open was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
  Unauthenticated,
  TooManyChannels,
  Unsupported(&'static str),
}

pub struct ConnectionHandler {
  tracing_span: tracing::Span,

  gateway: Arc<Gateway>,

  /// A random UUID assigned to each connection.
  client_id: Uuid,

  client_address: SocketAddr,

  /// The identity the peer authenticated as. Only `Some` after a successful
  /// authentication; no channel is accepted before that.
  verified_identity: Option<String>,

  /// Tells the negotiator that authentication finished, so it can stop the
  /// handshake clock.
  authenticated: Option<oneshot::Sender<String>>,

  channels: ChannelSet,
}

fn refuse(channel_id: ChannelId, session: &mut Session) {
  if let Err(error) = session.channel_failure(channel_id) {
    tracing::debug!(?error, "sending request failure failed");
  }
}

fn offered_methods() -> MethodSet {
  MethodSet::from([MethodKind::Password, MethodKind::PublicKey].as_slice())
}

impl ConnectionHandler {
  pub fn new(
    gateway: Arc<Gateway>,
    client_id: Uuid,
    client_address: SocketAddr,
    tracing_span: tracing::Span,
    authenticated: oneshot::Sender<String>,
  ) -> Self {
    Self {
      tracing_span,
      gateway,
      client_id,
      client_address,
      verified_identity: None,
      authenticated: Some(authenticated),
      channels: new_channel_set(),
    }
  }

  /// The connection's open channels. Handler tasks remove themselves as they
  /// finish, so this drains to empty after the connection is gone.
  pub fn channels(&self) -> ChannelSet {
    self.channels.clone()
  }

  fn check_credentials(&mut self, credentials: Credentials) -> Auth {
    match self.gateway.verifier.verify(&credentials) {
      Verdict::Accept => {
        tracing::info!(
          identity = %credentials.username,
          client_address = %self.client_address,
          "peer authenticated"
        );
        self.verified_identity = Some(credentials.username);
        Auth::Accept
      }
      Verdict::Reject(_) => Auth::Reject {
        proceed_with_methods: Some(offered_methods()),
        partial_success: false,
      },
    }
  }

  /// Whether a channel of `kind` may be opened right now. Returns the identity
  /// the channel will run as.
  fn admit(&self, kind: ChannelKind) -> Result<String, Refusal> {
    let Some(identity) = self.verified_identity.clone() else {
      return Err(Refusal::Unauthenticated);
    };
    if self.channels.len() >= self.gateway.limits.max_channels {
      return Err(Refusal::TooManyChannels);
    }
    match kind {
      ChannelKind::Unsupported(name) => Err(Refusal::Unsupported(name)),
      ChannelKind::Session | ChannelKind::Tunnel => Ok(identity),
    }
  }

  /// Decides a channel open. On acceptance the channel is registered and its
  /// handler task is running by the time this returns.
  fn open_channel(&mut self, channel: Channel<Msg>, kind: ChannelKind, session: &mut Session) -> bool {
    let channel_id = channel.id();
    let identity = match self.admit(kind) {
      Ok(identity) => identity,
      Err(Refusal::Unauthenticated) => {
        tracing::warn!(?channel_id, ?kind, "channel open before authentication; rejecting");
        return false;
      }
      Err(Refusal::TooManyChannels) => {
        tracing::warn!(
          ?channel_id,
          ?kind,
          max_channels = self.gateway.limits.max_channels,
          "too many open channels; rejecting"
        );
        return false;
      }
      Err(Refusal::Unsupported(name)) => {
        tracing::info!(?channel_id, kind = name, reason = "unsupported channel type", "channel open rejected");
        return false;
      }
    };

    let span = tracing::info_span!(parent: &self.tracing_span, "channel", ?channel_id, ?kind);
    match kind {
      ChannelKind::Session => {
        let (requests, receiver) = mpsc::unbounded_channel();
        let guard = ChannelGuard::register(&self.channels, channel_id, kind, Some(requests));
        let handler = SessionChannel {
          channel,
          handle: session.handle(),
          requests: receiver,
          guard,
          spawner: self.gateway.spawner.clone(),
          exec_timeout: self.gateway.limits.exec_timeout,
          identity,
        };
        tokio::spawn(handler.serve().instrument(span));
      }
      ChannelKind::Tunnel => {
        let guard = ChannelGuard::register(&self.channels, channel_id, kind, None);
        let handler = TunnelChannel {
          channel,
          handle: session.handle(),
          guard,
          target: self.gateway.relay.clone(),
        };
        tokio::spawn(handler.serve().instrument(span));
      }
      ChannelKind::Unsupported(_) => return false,
    }
    tracing::info!(?channel_id, ?kind, open_channels = self.channels.len(), "channel opened");
    true
  }

  /// Replies to a `shell` / `exec` request and, if granted, hands it to the
  /// channel's handler task. The reply is sent from here, before the handler
  /// acts, so replies always follow request order.
  fn bind_process(&self, channel_id: ChannelId, request: SessionRequest, session: &mut Session) {
    match claim_process(&self.channels, channel_id) {
      ProcessClaim::Granted(requests) => {
        let reply = if request.is_malformed() {
          session.channel_failure(channel_id)
        } else {
          session.channel_success(channel_id)
        };
        if let Err(error) = reply {
          tracing::debug!(?error, "sending request reply failed");
        }
        if requests.send(request).is_err() {
          tracing::debug!("session handler already finished");
        }
      }
      ProcessClaim::AlreadyBound => {
        tracing::warn!(?request, "channel already runs a process; rejecting request");
        refuse(channel_id, session);
      }
      ProcessClaim::NotASession => {
        tracing::info!(?request, "channel cannot run a process; rejecting request");
        refuse(channel_id, session);
      }
    }
  }

  fn refuse_request(&self, channel_id: ChannelId, request: &str, session: &mut Session) {
    tracing::debug!(request, "request not supported; replying failure");
    refuse(channel_id, session);
  }
}

impl russh::server::Handler for ConnectionHandler {
  type Error = anyhow::Error;

  #[tracing::instrument(parent = &self.tracing_span, skip(self))]
  async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
    Ok(self.check_credentials(Credentials {
      username: user.to_owned(),
      method: CredentialsType::None,
    }))
  }

  // NOTE: we don't log `password`.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, password))]
  async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
    Ok(self.check_credentials(Credentials {
      username: user.to_owned(),
      method: CredentialsType::Password {
        password: password.to_owned(),
      },
    }))
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, public_key))]
  async fn auth_publickey(&mut self, user: &str, public_key: &russh::keys::PublicKey) -> Result<Auth, Self::Error> {
    Ok(self.check_credentials(Credentials {
      username: user.to_owned(),
      method: CredentialsType::PublicKey {
        public_key_algorithm: public_key.algorithm().to_string(),
        public_key_base64: public_key.public_key_base64(),
      },
    }))
  }

  async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
    if let (Some(authenticated), Some(identity)) = (self.authenticated.take(), self.verified_identity.clone()) {
      // The negotiator may already have given up on this connection.
      let _ = authenticated.send(identity);
    }
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, channel, session))]
  async fn channel_open_session(&mut self, channel: Channel<Msg>, session: &mut Session) -> Result<bool, Self::Error> {
    Ok(self.open_channel(channel, ChannelKind::Session, session))
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, channel, session))]
  async fn channel_open_forwarded_tcpip(
    &mut self,
    channel: Channel<Msg>,
    host_to_connect: &str,
    port_to_connect: u32,
    originator_address: &str,
    originator_port: u32,
    session: &mut Session,
  ) -> Result<bool, Self::Error> {
    // Every tunnel goes to the configured relay target; the addresses the peer
    // names are only informational.
    Ok(self.open_channel(channel, ChannelKind::Tunnel, session))
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, channel, session))]
  async fn channel_open_direct_tcpip(
    &mut self,
    channel: Channel<Msg>,
    host_to_connect: &str,
    port_to_connect: u32,
    originator_address: &str,
    originator_port: u32,
    session: &mut Session,
  ) -> Result<bool, Self::Error> {
    Ok(self.open_channel(channel, ChannelKind::Unsupported("direct-tcpip"), session))
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, channel, session))]
  async fn channel_open_x11(
    &mut self,
    channel: Channel<Msg>,
    originator_address: &str,
    originator_port: u32,
    session: &mut Session,
  ) -> Result<bool, Self::Error> {
    Ok(self.open_channel(channel, ChannelKind::Unsupported("x11"), session))
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, session))]
  async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
    self.bind_process(channel_id, SessionRequest::Shell, session);
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, data, session))]
  async fn exec_request(&mut self, channel_id: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
    let request = match std::str::from_utf8(data) {
      Ok(command) => SessionRequest::Exec {
        command: command.to_owned(),
      },
      Err(error) => {
        tracing::warn!(?error, len = data.len(), "exec payload is not valid UTF-8");
        SessionRequest::Malformed {
          diagnostic: INVALID_EXEC_DIAGNOSTIC.to_owned(),
        }
      }
    };
    self.bind_process(channel_id, request, session);
    Ok(())
  }

  #[tracing::instrument(level = "debug", parent = &self.tracing_span, skip(self, modes, session))]
  async fn pty_request(
    &mut self,
    channel_id: ChannelId,
    term: &str,
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
    modes: &[(Pty, u32)],
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    self.refuse_request(channel_id, "pty-req", session);
    Ok(())
  }

  #[tracing::instrument(level = "debug", parent = &self.tracing_span, skip(self, variable_value, session))]
  async fn env_request(
    &mut self,
    channel_id: ChannelId,
    variable_name: &str,
    variable_value: &str,
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    self.refuse_request(channel_id, "env", session);
    Ok(())
  }

  #[tracing::instrument(level = "debug", parent = &self.tracing_span, skip(self, session))]
  async fn subsystem_request(
    &mut self,
    channel_id: ChannelId,
    subsystem: &str,
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    self.refuse_request(channel_id, "subsystem", session);
    Ok(())
  }

  #[tracing::instrument(level = "debug", parent = &self.tracing_span, skip(self, x11_auth_cookie, session))]
  async fn x11_request(
    &mut self,
    channel_id: ChannelId,
    single_connection: bool,
    x11_auth_protocol: &str,
    x11_auth_cookie: &str,
    x11_screen_number: u32,
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    self.refuse_request(channel_id, "x11-req", session);
    Ok(())
  }

  #[tracing::instrument(level = "debug", parent = &self.tracing_span, skip(self, session))]
  async fn window_change_request(
    &mut self,
    channel_id: ChannelId,
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    self.refuse_request(channel_id, "window-change", session);
    Ok(())
  }

  #[tracing::instrument(level = "debug", parent = &self.tracing_span, skip(self, _session))]
  async fn agent_request(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<bool, Self::Error> {
    Ok(false)
  }

  #[tracing::instrument(level = "debug", parent = &self.tracing_span, skip(self, _session))]
  async fn signal(&mut self, channel_id: ChannelId, signal: Sig, _session: &mut Session) -> Result<(), Self::Error> {
    // Signals carry no reply. Processes are only ever stopped by closing the channel.
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn tcpip_forward(&mut self, address: &str, port: &mut u32, _session: &mut Session) -> Result<bool, Self::Error> {
    tracing::info!("remote forwarding not handled");
    Ok(false)
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
    Ok(false)
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn streamlocal_forward(&mut self, socket_path: &str, _session: &mut Session) -> Result<bool, Self::Error> {
    tracing::info!("streamlocal forwarding not handled");
    Ok(false)
  }

  #[tracing::instrument(level = "debug", parent = &self.tracing_span, skip(self, _session))]
  async fn channel_close(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
    // The channel's handler task sees the close on its own stream and releases
    // the slot.
    tracing::debug!(client_id = %self.client_id, "peer closed channel");
    Ok(())
  }
}
