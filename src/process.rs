use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

/// What a session channel asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
  /// An interactive command interpreter.
  Shell,
  /// A one-shot command, interpreted by `<interpreter> -c <command>`.
  Exec { command: String },
}

impl std::fmt::Display for Invocation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Invocation::Shell => f.write_str("<shell>"),
      Invocation::Exec { command } => f.write_str(command),
    }
  }
}

/// Builds the child processes that back `shell` and `exec` requests.
///
/// Children inherit the gateway's own environment and working directory. All
/// three stdio streams are piped so they can be bound to the channel.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
  pub shell: PathBuf,
  pub interpreter: PathBuf,
}

impl Default for ProcessSpawner {
  fn default() -> Self {
    Self {
      shell: PathBuf::from("/bin/bash"),
      interpreter: PathBuf::from("sh"),
    }
  }
}

impl ProcessSpawner {
  pub fn command(&self, invocation: &Invocation) -> tokio::process::Command {
    let mut command = match invocation {
      Invocation::Shell => tokio::process::Command::new(&self.shell),
      Invocation::Exec { command: line } => {
        let mut command = tokio::process::Command::new(&self.interpreter);
        command.arg("-c").arg(line);
        command
      }
    };
    command
      // kill_on_drop(true) is essential to prevent leaking processes.
      .kill_on_drop(true)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    command
  }
}

/// The value reported in an SSH `exit-status` message.
// NOTE: .code() can return None when the child process is killed via a
// signal like ctrl-c.
pub fn exit_code(exit_status: &ExitStatus) -> u32 {
  match (exit_status.code(), exit_status.signal()) {
    (Some(code), _) => code.try_into().unwrap_or(1),
    (None, Some(signal)) => signal as u32 + 128,
    (None, None) => 1,
  }
}
