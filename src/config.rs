use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// The per-device credentials file, passed with `--credentials-file`.
///
/// ```json
/// {
///   "devices": {
///     "sensor-0042": {
///       "password": "hunter2",
///       "authorized_keys": ["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA... sensor-0042"]
///     }
///   }
/// }
/// ```
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct CredentialsFile {
  /// Keyed by the SSH user name the device authenticates as.
  #[serde(default)]
  pub devices: HashMap<String, DeviceCredentials>,
}

#[derive(Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct DeviceCredentials {
  /// Password accepted for this device, if any.
  #[serde(default)]
  pub password: Option<String>,

  /// Public keys in OpenSSH `authorized_keys` format. The bare base64 blob is
  /// accepted too.
  #[serde(default)]
  pub authorized_keys: Vec<String>,
}

// Hand-written so that passwords never end up in logs.
impl std::fmt::Debug for DeviceCredentials {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DeviceCredentials")
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .field("authorized_keys", &self.authorized_keys.len())
      .finish()
  }
}

impl CredentialsFile {
  pub fn parse(contents: &str) -> anyhow::Result<Self> {
    serde_json::from_str(contents).context("Failed to parse credentials file as JSON")
  }

  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let contents =
      std::fs::read_to_string(path).with_context(|| format!("Failed to read credentials file {}", path.display()))?;
    let file = Self::parse(&contents).with_context(|| format!("Invalid credentials file {}", path.display()))?;
    tracing::info!(path = %path.display(), devices = file.devices.len(), "loaded device credentials");
    Ok(file)
  }
}
