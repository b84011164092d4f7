use crate::channel::{ChannelGuard, ChannelState};
use crate::process::{exit_code, Invocation, ProcessSpawner};
use anyhow::Context;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// SSH extended data type code for stderr.
const STDERR: u32 = 1;

/// How long to keep forwarding output after the process exited. Only matters if
/// a grandchild inherited the pipes and outlives the process itself.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit status reported when the process couldn't be started, as a shell would.
const SPAWN_FAILED_EXIT_STATUS: u32 = 127;

/// Exit status reported when an exec ran into its time limit, as timeout(1) would.
const TIMED_OUT_EXIT_STATUS: u32 = 124;

/// A granted channel request, forwarded by the dispatcher after it has replied
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
  Shell,
  Exec { command: String },
  /// An `exec` whose payload could not be decoded.
  Malformed { diagnostic: String },
}

impl SessionRequest {
  pub fn is_malformed(&self) -> bool {
    matches!(self, SessionRequest::Malformed { .. })
  }
}

/// How a spawned process stopped being our concern.
enum Termination {
  Exited(ExitStatus),
  /// The channel closed or the connection dropped underneath the process.
  Hangup,
  TimedOut(Duration),
}

/// Serves one `session` channel: waits for its single `shell` / `exec`, runs it
/// with stdio bound to the channel, then closes the channel.
pub struct SessionChannel {
  pub channel: Channel<Msg>,
  pub handle: Handle,
  pub requests: mpsc::UnboundedReceiver<SessionRequest>,
  pub guard: ChannelGuard,
  pub spawner: Arc<ProcessSpawner>,
  pub exec_timeout: Option<Duration>,
  /// Authenticated identity of the peer, for the audit trail.
  pub identity: String,
}

async fn pipe_to_channel<R>(channel_id: ChannelId, handle: Handle, extended: Option<u32>, mut reader: R)
where
  R: tokio::io::AsyncRead + std::marker::Unpin,
{
  let mut buffer = vec![0; 8192];
  loop {
    let n = match reader.read(&mut buffer).await {
      Ok(0) => break,
      Ok(n) => n,
      Err(error) => {
        tracing::debug!(?error, "reading child output failed");
        break;
      }
    };
    let data = CryptoVec::from_slice(&buffer[0..n]);
    let sent = match extended {
      Some(code) => handle.extended_data(channel_id, code, data).await,
      None => handle.data(channel_id, data).await,
    };
    // The peer may close the channel before we finish writing to it.
    if sent.is_err() {
      tracing::debug!("channel gone while forwarding child output");
      break;
    }
  }
}

/// Feeds channel data to the child's stdin. Runs beside the supervising loop so
/// that a child which stops reading never stalls it. Returns once the queue is
/// closed (channel EOF) or the child closes its end; dropping `writer` then hands
/// the EOF on to the child.
async fn pipe_from_channel<W>(mut input: mpsc::UnboundedReceiver<CryptoVec>, mut writer: W)
where
  W: tokio::io::AsyncWrite + std::marker::Unpin,
{
  while let Some(data) = input.recv().await {
    if let Err(error) = writer.write_all(&data).await {
      tracing::debug!(?error, "child stdin closed");
      break;
    }
  }
}

async fn close_channel(handle: &Handle, channel_id: ChannelId, exit_status: u32) {
  if let Err(error) = handle.exit_status_request(channel_id, exit_status).await {
    tracing::debug!(?error, "sending exit status failed");
  }
  if let Err(error) = handle.eof(channel_id).await {
    tracing::debug!(?error, "sending eof failed");
  }
  if let Err(error) = handle.close(channel_id).await {
    tracing::debug!(?error, "sending close failed");
  }
}

async fn time_limit(limit: Option<Duration>) -> Duration {
  match limit {
    Some(limit) => {
      tokio::time::sleep(limit).await;
      limit
    }
    None => std::future::pending().await,
  }
}

impl SessionChannel {
  pub async fn serve(mut self) {
    self.guard.advance(ChannelState::Active);
    match self.next_request().await {
      Some(SessionRequest::Shell) => self.run(Invocation::Shell).await,
      Some(SessionRequest::Exec { command }) => self.run(Invocation::Exec { command }).await,
      Some(SessionRequest::Malformed { diagnostic }) => {
        self.guard.advance(ChannelState::Closing);
        self.write_stderr(&diagnostic).await;
        close_channel(&self.handle, self.channel.id(), 1).await;
      }
      None => {
        tracing::debug!("channel closed before any process was requested");
        self.guard.advance(ChannelState::Closing);
      }
    }
    // Dropping `self.guard` marks the channel closed and releases its slot.
  }

  /// Waits for the dispatcher to hand over a granted request. Returns `None` if
  /// the channel or the whole connection goes away first.
  async fn next_request(&mut self) -> Option<SessionRequest> {
    loop {
      tokio::select! {
        // The dispatcher queues the request before russh reads the next packet,
        // so checking requests first keeps data meant for stdin in the channel.
        biased;
        request = self.requests.recv() => return request,
        message = self.channel.wait() => match message {
          Some(ChannelMsg::Close) | None => return None,
          Some(message) => tracing::trace!(?message, "ignoring message before process start"),
        },
      }
    }
  }

  async fn write_stderr(&self, text: &str) {
    let data = CryptoVec::from_slice(text.as_bytes());
    if self.handle.extended_data(self.channel.id(), STDERR, data).await.is_err() {
      tracing::debug!("could not write diagnostic to channel");
    }
  }

  #[tracing::instrument(level = "debug", skip(self), fields(identity = %self.identity))]
  async fn run(&mut self, invocation: Invocation) {
    let channel_id = self.channel.id();
    let outcome = self.supervise(&invocation).await;
    self.guard.advance(ChannelState::Closing);

    match outcome {
      Ok(Termination::Exited(status)) => {
        let code = exit_code(&status);
        tracing::info!(
          target: "tunnelgate::audit",
          identity = %self.identity,
          command = %invocation,
          exit_status = code,
          "process exited"
        );
        if code != 0 && matches!(invocation, Invocation::Exec { .. }) {
          self.write_stderr(&format!("Command exited with status {code}\n")).await;
        }
        close_channel(&self.handle, channel_id, code).await;
      }
      Ok(Termination::TimedOut(limit)) => {
        tracing::warn!(
          target: "tunnelgate::audit",
          identity = %self.identity,
          command = %invocation,
          ?limit,
          "process killed after exceeding exec timeout"
        );
        self.write_stderr(&format!("Command timed out after {}s\n", limit.as_secs())).await;
        close_channel(&self.handle, channel_id, TIMED_OUT_EXIT_STATUS).await;
      }
      Ok(Termination::Hangup) => {
        tracing::info!(
          target: "tunnelgate::audit",
          identity = %self.identity,
          command = %invocation,
          "channel closed while process was running; process killed"
        );
        if let Err(error) = self.handle.close(channel_id).await {
          tracing::debug!(?error, "sending close failed");
        }
      }
      Err(error) => {
        tracing::error!(
          target: "tunnelgate::audit",
          identity = %self.identity,
          command = %invocation,
          ?error,
          "failed to run process"
        );
        self.write_stderr(&format!("Failed to execute command: {error:#}\n")).await;
        close_channel(&self.handle, channel_id, SPAWN_FAILED_EXIT_STATUS).await;
      }
    }
  }

  /// Spawns the process and shuttles bytes until it exits or the channel goes
  /// away. The child is reaped on every path that returns `Ok`; on `Err` it is
  /// dropped, which kills it.
  async fn supervise(&mut self, invocation: &Invocation) -> anyhow::Result<Termination> {
    let channel_id = self.channel.id();
    let mut child = self
      .spawner
      .command(invocation)
      .spawn()
      .context("Failed to spawn child process")?;
    tracing::info!(
      target: "tunnelgate::audit",
      identity = %self.identity,
      command = %invocation,
      pid = child.id(),
      "process spawned"
    );

    let stdout = child.stdout.take().context("Failed to get stdout for child process")?;
    let stderr = child.stderr.take().context("Failed to get stderr for child process")?;
    let stdin = child.stdin.take().context("Failed to get stdin for child process")?;

    let output = futures::future::join(
      pipe_to_channel(channel_id, self.handle.clone(), None, stdout),
      pipe_to_channel(channel_id, self.handle.clone(), Some(STDERR), stderr),
    );
    tokio::pin!(output);
    let mut output_drained = false;

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let mut input_tx = Some(input_tx);
    let input = pipe_from_channel(input_rx, stdin);
    tokio::pin!(input);
    let mut input_closed = false;

    let limit = match invocation {
      Invocation::Exec { .. } => self.exec_timeout,
      Invocation::Shell => None,
    };
    let deadline = time_limit(limit);
    tokio::pin!(deadline);

    let termination = loop {
      tokio::select! {
        status = child.wait() => break Termination::Exited(status.context("Failed to wait for child process")?),
        _ = &mut output, if !output_drained => output_drained = true,
        _ = &mut input, if !input_closed => input_closed = true,
        message = self.channel.wait() => match message {
          Some(ChannelMsg::Data { data }) => {
            // Fails only after the child closed stdin; the data has nowhere to go.
            if let Some(Err(_)) = input_tx.as_ref().map(|queue| queue.send(data)) {
              input_tx = None;
            }
          }
          Some(ChannelMsg::Eof) => input_tx = None,
          Some(ChannelMsg::Close) | None => break Termination::Hangup,
          Some(_) => {}
        },
        limit = &mut deadline => break Termination::TimedOut(limit),
      }
    };
    drop(input_tx);

    match termination {
      Termination::Exited(_) => {
        if !output_drained && tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut output).await.is_err() {
          tracing::warn!("process exited but its output pipes stayed open; dropping the rest");
        }
      }
      Termination::Hangup | Termination::TimedOut(_) => {
        if let Err(error) = child.start_kill() {
          tracing::debug!(?error, "kill failed, process already gone");
        }
        let status = child.wait().await.context("Failed to reap child process")?;
        tracing::debug!(?status, "child reaped");
      }
    }
    Ok(termination)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn stdin_pump_forwards_in_order_then_closes() {
    let (child_end, mut child_stdin) = tokio::io::duplex(64);
    let (queue, input) = mpsc::unbounded_channel();
    queue.send(CryptoVec::from_slice(b"first ")).unwrap();
    queue.send(CryptoVec::from_slice(b"second")).unwrap();
    drop(queue);

    pipe_from_channel(input, child_end).await;
    let mut received = Vec::new();
    child_stdin.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"first second");
  }

  #[tokio::test]
  async fn stdin_pump_stops_when_child_closes_stdin() {
    let (child_end, child_stdin) = tokio::io::duplex(64);
    drop(child_stdin);
    let (queue, input) = mpsc::unbounded_channel();
    queue.send(CryptoVec::from_slice(b"nobody listens")).unwrap();

    pipe_from_channel(input, child_end).await;
    // The pump dropped its receiver, so later data is refused rather than queued.
    assert!(queue.send(CryptoVec::from_slice(b"more")).is_err());
  }
}
