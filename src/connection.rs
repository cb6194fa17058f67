//! The connection file a kernel writes at launch, describing how to reach it.
//!
//! See <https://jupyter-client.readthedocs.io/en/stable/kernels.html#connection-files>
//! for the on-disk format.

use std::time::Duration;

use serde::Deserialize;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Transport scheme a kernel was told to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain TCP over loopback or a routable address.
    Tcp,
    /// Unix domain sockets, addressed by filesystem path.
    Ipc,
}

/// Signature scheme used to authenticate wire frames.
///
/// Wraps the raw scheme name from the connection file rather than an enum,
/// since `"hmac-sha256"` is the only scheme this crate implements but the
/// field should still round-trip an unrecognized name for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SignatureScheme(String);

impl SignatureScheme {
    /// Whether this is the HMAC-SHA256 scheme this crate can sign/verify.
    pub fn is_hmac_sha256(&self) -> bool {
        self.0 == "hmac-sha256"
    }
}

impl std::fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed contents of a kernel's connection file.
#[derive(Clone, Debug, Deserialize)]
pub struct ConnectionInfo {
    /// Transport scheme, `"tcp"` or `"ipc"`.
    pub transport: Transport,

    /// IP address (for `tcp`) or base path (for `ipc`).
    pub ip: String,

    /// Port for the shell request/reply channel.
    pub shell_port: u16,

    /// Port for the iopub broadcast channel.
    pub iopub_port: u16,

    /// Port for the control request/reply channel.
    pub control_port: u16,

    /// Port for the stdin channel. Unused by this crate.
    pub stdin_port: u16,

    /// Port for the heartbeat channel. Unused by this crate.
    pub hb_port: u16,

    /// The HMAC signing key. An empty key disables signing.
    pub key: String,

    /// Name of the signature scheme, normally `"hmac-sha256"`.
    pub signature_scheme: SignatureScheme,
}

impl ConnectionInfo {
    /// Build the `tcp://` or `ipc://` endpoint address for a given port.
    pub fn endpoint(&self, port: u16) -> String {
        match self.transport {
            Transport::Tcp => format!("tcp://{}:{port}", self.ip),
            Transport::Ipc => format!("ipc://{}-{port}", self.ip),
        }
    }

    /// Poll for the connection file to appear, then read and parse it.
    ///
    /// Polls up to `attempts` times spaced `interval` apart. Once the file
    /// exists, waits an additional `debounce` before reading, so a kernel
    /// that creates the file before finishing the write is not read mid-write.
    pub async fn wait_and_read(
        path: &str,
        attempts: u32,
        interval: Duration,
        debounce: Duration,
    ) -> Result<Self> {
        let mut found = false;
        for attempt in 0..attempts {
            if fs::try_exists(path).await.unwrap_or(false) {
                found = true;
                break;
            }
            debug!(attempt, path, "waiting for connection file");
            sleep(interval).await;
        }
        if !found {
            return Err(Error::ConnectionFileTimeout(path.to_string()));
        }

        sleep(debounce).await;

        let contents = fs::read_to_string(path)
            .await
            .map_err(|err| Error::ConnectionFile(err.to_string()))?;
        let info: ConnectionInfo = serde_json::from_str(&contents)
            .map_err(|err| Error::ConnectionFile(err.to_string()))?;

        if info.key.is_empty() {
            warn!(path, "connection file has an empty signing key, signing is disabled");
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_connection_file() {
        let json = r#"
            {
                "control_port": 50160,
                "shell_port": 57503,
                "transport": "tcp",
                "signature_scheme": "hmac-sha256",
                "stdin_port": 52597,
                "hb_port": 43419,
                "ip": "127.0.0.1",
                "iopub_port": 40885,
                "key": "deadbeef-dead-beef-dead-beefdeadbeef"
            }
        "#;
        let info: ConnectionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.transport, Transport::Tcp);
        assert_eq!(info.shell_port, 57503);
        assert!(info.signature_scheme.is_hmac_sha256());
        assert_eq!(info.endpoint(info.shell_port), "tcp://127.0.0.1:57503");
    }

    #[test]
    fn accepts_an_empty_key() {
        let json = r#"
            {
                "control_port": 1, "shell_port": 2, "iopub_port": 3,
                "stdin_port": 4, "hb_port": 5,
                "transport": "tcp", "ip": "127.0.0.1",
                "signature_scheme": "hmac-sha256", "key": ""
            }
        "#;
        let info: ConnectionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.key, "");
    }

    #[tokio::test]
    async fn times_out_when_file_never_appears() {
        let err = ConnectionInfo::wait_and_read(
            "/tmp/kernel-client-core-definitely-missing-connection-file.json",
            2,
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConnectionFileTimeout(_)));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn warns_when_connection_file_has_an_empty_key() {
        let path = std::env::temp_dir()
            .join(format!("kernel-client-core-test-{}.json", uuid::Uuid::new_v4()));
        let json = r#"
            {
                "control_port": 1, "shell_port": 2, "iopub_port": 3,
                "stdin_port": 4, "hb_port": 5,
                "transport": "tcp", "ip": "127.0.0.1",
                "signature_scheme": "hmac-sha256", "key": ""
            }
        "#;
        tokio::fs::write(&path, json).await.unwrap();

        let info = ConnectionInfo::wait_and_read(
            path.to_string_lossy().as_ref(),
            5,
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert_eq!(info.key, "");
        assert!(logs_contain("connection file has an empty signing key"));

        let _ = tokio::fs::remove_file(&path).await;
    }
}
