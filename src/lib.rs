//! A reverse-access SSH gateway.
//!
//! Remote devices dial in over SSH and, once authenticated, every connection can
//! carry any number of independent channels:
//!
//! * `session` channels run a `shell` or a one-shot `exec` command on the gateway
//!   host, with the process' stdio bound to the channel.
//! * `forwarded-tcpip` channels are relayed byte-for-byte to a single configured
//!   local TCP endpoint.
//!
//! Everything else is rejected. See [`listener::serve`] for the entry point.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod listener;
pub mod negotiator;
pub mod process;
pub mod session;
pub mod tunnel;
pub mod verifier;

pub use config::{CredentialsFile, DeviceCredentials};
pub use gateway::{Gateway, Limits};
pub use process::ProcessSpawner;
pub use tunnel::RelayTarget;
pub use verifier::{CredentialVerifier, Credentials, CredentialsType, RejectReason, Verdict};
