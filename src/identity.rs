use crate::types::{MachineId, NetError};
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair};

/// A peer's root of trust: an Ed25519 signing keypair. The peer id (and the
/// mesh-layer machine id, which is the same string) is derived from the
/// public key and stable across runs as long as the same keypair is loaded.
pub struct IdentityKeypair {
    keypair: Ed25519KeyPair,
    pkcs8: Vec<u8>,
}

impl IdentityKeypair {
    pub fn generate() -> Result<Self, NetError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| NetError::InvalidConfiguration("keypair generation failed".into()))?;
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|_| NetError::InvalidConfiguration("keypair generation failed".into()))?;
        Ok(IdentityKeypair {
            keypair,
            pkcs8: pkcs8.as_ref().to_vec(),
        })
    }

    /// Reload an identity persisted by the embedder.
    pub fn from_pkcs8(doc: &[u8]) -> Result<Self, NetError> {
        let keypair = Ed25519KeyPair::from_pkcs8(doc)
            .map_err(|_| NetError::InvalidConfiguration("bad pkcs8 identity document".into()))?;
        Ok(IdentityKeypair {
            keypair,
            pkcs8: doc.to_vec(),
        })
    }

    pub fn to_pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.keypair.public_key().as_ref().to_vec()
    }

    /// hex(SHA-256(public key)): the peer id, also used as the machine id in
    /// the mesh layer.
    pub fn peer_id(&self) -> MachineId {
        peer_id_from_public_key(self.keypair.public_key().as_ref())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message).as_ref().to_vec()
    }
}

pub fn peer_id_from_public_key(public_key: &[u8]) -> MachineId {
    let digest = ring::digest::digest(&ring::digest::SHA256, public_key);
    hex::encode(digest.as_ref())
}

pub fn verify(public_key: &[u8], message: &[u8], sig: &[u8]) -> bool {
    let key = signature::UnparsedPublicKey::new(&signature::ED25519, public_key);
    key.verify(message, sig).is_ok()
}
