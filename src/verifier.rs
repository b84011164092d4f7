use crate::config::{CredentialsFile, DeviceCredentials};
use anyhow::{bail, Context};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::{Choice, ConstantTimeEq};

type SecretDigest = [u8; 32];

#[derive(Clone)]
pub enum CredentialsType {
  None,
  Password {
    password: String,
  },
  PublicKey {
    public_key_algorithm: String,
    /// The key blob as it appears in the second field of an `authorized_keys`
    /// line.
    public_key_base64: String,
  },
}

impl CredentialsType {
  pub fn method_name(&self) -> &'static str {
    match self {
      CredentialsType::None => "none",
      CredentialsType::Password { .. } => "password",
      CredentialsType::PublicKey { .. } => "publickey",
    }
  }
}

#[derive(Clone)]
pub struct Credentials {
  pub username: String,
  pub method: CredentialsType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  Accept,
  Reject(RejectReason),
}

/// Deliberately coarse: an unknown identity and a wrong secret produce the same
/// reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
  BadCredentials,
  MethodNotAllowed,
}

struct DeviceRecord {
  password: Option<SecretDigest>,
  authorized_keys: Vec<SecretDigest>,
}

/// Checks presented credentials against the configured device table and the
/// optional fleet-wide shared secret.
///
/// Every lookup performs the same digest comparisons whether or not the identity
/// exists: a missing device is replaced by a decoy record of the same shape and
/// the result is masked out afterwards.
pub struct CredentialVerifier {
  devices: HashMap<String, DeviceRecord>,
  shared_secret: Option<SecretDigest>,
  decoy: DeviceRecord,
}

fn digest(bytes: &[u8]) -> SecretDigest {
  Sha256::digest(bytes).into()
}

/// Extracts the base64 key blob from an `authorized_keys` style line.
fn authorized_key_blob(line: &str) -> anyhow::Result<&str> {
  let fields: Vec<&str> = line.split_whitespace().collect();
  match fields.as_slice() {
    [] => bail!("empty authorized key"),
    [blob] => Ok(*blob),
    [algorithm, blob, ..] if algorithm.starts_with("ssh-") || algorithm.starts_with("ecdsa-") || algorithm.starts_with("sk-") => {
      Ok(*blob)
    }
    _ => bail!("authorized key options are not supported: {line:?}"),
  }
}

impl DeviceRecord {
  fn from_credentials(credentials: &DeviceCredentials) -> anyhow::Result<Self> {
    let authorized_keys = credentials
      .authorized_keys
      .iter()
      .map(|line| authorized_key_blob(line).map(|blob| digest(blob.as_bytes())))
      .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Self {
      password: credentials.password.as_deref().map(|password| digest(password.as_bytes())),
      authorized_keys,
    })
  }
}

impl CredentialVerifier {
  pub fn new(shared_secret: Option<&str>, credentials: &CredentialsFile) -> anyhow::Result<Self> {
    let devices = credentials
      .devices
      .iter()
      .map(|(identity, device)| {
        DeviceRecord::from_credentials(device)
          .with_context(|| format!("Invalid credentials for device {identity:?}"))
          .map(|record| (identity.clone(), record))
      })
      .collect::<anyhow::Result<HashMap<_, _>>>()?;

    if shared_secret.is_none() && devices.is_empty() {
      bail!("No credentials configured: pass a shared secret or a credentials file with at least one device");
    }
    if shared_secret.is_some_and(str::is_empty) {
      bail!("The shared secret must not be empty");
    }

    Ok(Self {
      devices,
      shared_secret: shared_secret.map(|secret| digest(secret.as_bytes())),
      decoy: DeviceRecord {
        password: Some(digest(b"tunnelgate decoy password")),
        authorized_keys: vec![digest(b"tunnelgate decoy key")],
      },
    })
  }

  /// Decide whether `credentials` authenticate their claimed identity. Writes one
  /// audit log line; never logs the secret itself.
  pub fn verify(&self, credentials: &Credentials) -> Verdict {
    let verdict = self.decide(credentials);
    let key_algorithm = match &credentials.method {
      CredentialsType::PublicKey { public_key_algorithm, .. } => Some(public_key_algorithm.as_str()),
      _ => None,
    };
    match verdict {
      Verdict::Accept => tracing::info!(
        target: "tunnelgate::audit",
        identity = %credentials.username,
        method = credentials.method.method_name(),
        key_algorithm,
        "credentials accepted"
      ),
      Verdict::Reject(reason) => tracing::info!(
        target: "tunnelgate::audit",
        identity = %credentials.username,
        method = credentials.method.method_name(),
        key_algorithm,
        ?reason,
        "credentials rejected"
      ),
    }
    verdict
  }

  fn decide(&self, credentials: &Credentials) -> Verdict {
    let device = self.devices.get(&credentials.username);
    let known = Choice::from(device.is_some() as u8);
    let record = device.unwrap_or(&self.decoy);

    let accepted = match &credentials.method {
      CredentialsType::None => return Verdict::Reject(RejectReason::MethodNotAllowed),
      CredentialsType::Password { password } => {
        let presented = digest(password.as_bytes());

        let (expected, has_password) = match &record.password {
          Some(expected) => (expected, true),
          None => (self.decoy.password.as_ref().unwrap_or(&presented), false),
        };
        let device_match = expected.as_slice().ct_eq(presented.as_slice()) & known & Choice::from(has_password as u8);

        let (shared, has_shared) = match &self.shared_secret {
          Some(shared) => (shared, true),
          None => (expected, false),
        };
        let shared_match = shared.as_slice().ct_eq(presented.as_slice()) & Choice::from(has_shared as u8);

        device_match | shared_match
      }
      CredentialsType::PublicKey { public_key_base64, .. } => {
        let presented = digest(public_key_base64.as_bytes());
        let mut matched = Choice::from(0);
        for authorized in &record.authorized_keys {
          matched |= authorized.as_slice().ct_eq(presented.as_slice());
        }
        matched & known
      }
    };

    if bool::from(accepted) {
      Verdict::Accept
    } else {
      Verdict::Reject(RejectReason::BadCredentials)
    }
  }
}
