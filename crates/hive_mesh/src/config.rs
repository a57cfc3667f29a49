//! Mesh configuration for a node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Configuration for a mesh node. Read-only once the mesh is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshOptions {
    /// Address to listen on for incoming peer connections.
    pub listen_addr: SocketAddr,

    /// Opaque tag naming the logical mesh this node belongs to. Nodes with
    /// differing ids never complete a handshake.
    #[serde(with = "hex_bytes_serde")]
    pub network_id: Vec<u8>,

    /// Externally reachable address advertised to peers, if any.
    #[serde(default)]
    pub advertisement: Option<String>,

    /// Consecutive failed attempts tolerated per dialed address before it is
    /// abandoned. `0` retries forever.
    pub max_retries_per_peer: u32,

    /// Upper bound for dialing plus the whole handshake.
    #[serde(rename = "connection_timeout_ms", with = "duration_ms_serde")]
    pub connection_timeout: Duration,

    /// Pause between a failed or closed outbound connection and the redial.
    #[serde(rename = "connection_recovery_delay_ms", with = "duration_ms_serde")]
    pub connection_recovery_delay: Duration,

    /// Seed addresses dialed on start.
    #[serde(default)]
    pub initial_peers: Vec<SocketAddr>,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9480)),
            network_id: b"hive-mesh".to_vec(),
            advertisement: None,
            max_retries_per_peer: 5,
            connection_timeout: Duration::from_secs(10),
            connection_recovery_delay: Duration::from_secs(5),
            initial_peers: Vec::new(),
        }
    }
}

impl MeshOptions {
    /// Replace the network id.
    pub fn with_network_id(mut self, network_id: impl AsRef<[u8]>) -> Self {
        self.network_id = network_id.as_ref().to_vec();
        self
    }

    /// Check the options can be carried on the wire and drive the workers.
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.network_id.is_empty() {
            return Err(MeshError::InvalidConfig("network_id is empty".into()));
        }
        if self.network_id.len() > u16::MAX as usize {
            return Err(MeshError::InvalidConfig(format!(
                "network_id is {} bytes, at most {} allowed",
                self.network_id.len(),
                u16::MAX
            )));
        }
        if let Some(ad) = &self.advertisement {
            if ad.len() > u16::MAX as usize {
                return Err(MeshError::InvalidConfig("advertisement too long".into()));
            }
        }
        if self.connection_timeout.is_zero() {
            return Err(MeshError::InvalidConfig(
                "connection_timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Save the options to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), MeshError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load options from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<MeshOptions>(&data) {
                    Ok(options) => return options,
                    Err(e) => {
                        tracing::warn!("Corrupt mesh options file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read mesh options file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod hex_bytes_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
