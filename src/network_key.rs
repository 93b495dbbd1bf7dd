use crate::types::{print, NetError, PrintSender};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

pub const JOIN_URL_PREFIX: &str = "omerta://join/";
const NETWORKS_FILE: &str = "networks.json";

/// A shared-secret membership token: peers holding the same key (and name)
/// are members of the same network. Encoded for out-of-band sharing as
/// `omerta://join/<base64url(json)>`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkKey {
    #[serde(with = "base64_bytes")]
    pub network_key: Vec<u8>,
    pub network_name: String,
    pub bootstrap_peers: Vec<String>,
    pub created_at: String,
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::decode(s).map_err(serde::de::Error::custom)
    }
}

impl NetworkKey {
    /// Mint a fresh 256-bit network secret.
    pub fn generate(network_name: &str, bootstrap_peers: Vec<String>) -> Result<Self, NetError> {
        let mut key = vec![0u8; 32];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| NetError::InvalidConfiguration("system rng failed".into()))?;
        Ok(NetworkKey {
            network_key: key,
            network_name: network_name.to_string(),
            bootstrap_peers,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Deterministic id all members derive identically:
    /// first 16 hex chars of SHA-256 over key, name, and sorted bootstraps.
    pub fn network_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.network_key);
        hasher.update(self.network_name.as_bytes());
        let mut peers = self.bootstrap_peers.clone();
        peers.sort();
        for peer in peers {
            hasher.update(peer.as_bytes());
        }
        hex::encode(hasher.finalize())[..16].to_string()
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("network key serialization cannot fail");
        format!(
            "{JOIN_URL_PREFIX}{}",
            base64::encode_config(json, base64::URL_SAFE_NO_PAD)
        )
    }

    pub fn decode(url: &str) -> Result<Self, NetError> {
        let encoded = url
            .strip_prefix(JOIN_URL_PREFIX)
            .ok_or_else(|| NetError::InvalidConfiguration("not an omerta join url".into()))?;
        let json = base64::decode_config(encoded, base64::URL_SAFE_NO_PAD)
            .map_err(|_| NetError::InvalidConfiguration("malformed base64 in join url".into()))?;
        serde_json::from_slice(&json)
            .map_err(|_| NetError::InvalidConfiguration("malformed json in join url".into()))
    }
}

/// One joined network as persisted in `networks.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Network {
    pub network_id: String,
    pub network_key: NetworkKey,
    pub enabled: bool,
    pub joined_at: String,
    pub last_seen: Option<String>,
}

/// Joined-network configuration, loaded at startup and written back on every
/// mutation. Entries that fail to parse are skipped with a warning rather
/// than poisoning the whole file.
pub struct NetworkStore {
    path: PathBuf,
    networks: Vec<Network>,
    print_tx: PrintSender,
}

impl NetworkStore {
    pub async fn load(home_directory: &str, print_tx: PrintSender) -> Self {
        let path = PathBuf::from(home_directory).join(NETWORKS_FILE);
        let networks = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<serde_json::Value>>(&bytes) {
                Ok(entries) => {
                    let mut networks = Vec::new();
                    for entry in entries {
                        match serde_json::from_value::<Network>(entry) {
                            Ok(network) => networks.push(network),
                            Err(e) => {
                                print(
                                    &print_tx,
                                    0,
                                    format!("net: skipping invalid entry in {NETWORKS_FILE}: {e}"),
                                )
                                .await;
                            }
                        }
                    }
                    networks
                }
                Err(e) => {
                    print(&print_tx, 0, format!("net: unreadable {NETWORKS_FILE}: {e}")).await;
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        NetworkStore {
            path,
            networks,
            print_tx,
        }
    }

    async fn save(&self) {
        let json = serde_json::to_vec_pretty(&self.networks)
            .expect("network list serialization cannot fail");
        if let Err(e) = tokio::fs::write(&self.path, json).await {
            print(
                &self.print_tx,
                0,
                format!("net: failed to write {}: {e}", self.path.display()),
            )
            .await;
        }
    }

    pub async fn join(&mut self, url: &str) -> Result<String, NetError> {
        let key = NetworkKey::decode(url)?;
        let network_id = key.network_id();
        if self.networks.iter().any(|n| n.network_id == network_id) {
            return Err(NetError::AlreadyJoined);
        }
        self.networks.push(Network {
            network_id: network_id.clone(),
            network_key: key,
            enabled: true,
            joined_at: chrono::Utc::now().to_rfc3339(),
            last_seen: None,
        });
        self.save().await;
        Ok(network_id)
    }

    pub async fn leave(&mut self, network_id: &str) -> Result<(), NetError> {
        let before = self.networks.len();
        self.networks.retain(|n| n.network_id != network_id);
        if self.networks.len() == before {
            return Err(NetError::NotFound);
        }
        self.save().await;
        Ok(())
    }

    pub async fn set_enabled(&mut self, network_id: &str, enabled: bool) -> Result<(), NetError> {
        let network = self
            .networks
            .iter_mut()
            .find(|n| n.network_id == network_id)
            .ok_or(NetError::NotFound)?;
        network.enabled = enabled;
        self.save().await;
        Ok(())
    }

    pub async fn touch(&mut self, network_id: &str) -> Result<(), NetError> {
        let network = self
            .networks
            .iter_mut()
            .find(|n| n.network_id == network_id)
            .ok_or(NetError::NotFound)?;
        network.last_seen = Some(chrono::Utc::now().to_rfc3339());
        self.save().await;
        Ok(())
    }

    pub fn list(&self) -> &[Network] {
        &self.networks
    }

    pub fn get(&self, network_id: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.network_id == network_id)
    }
}
