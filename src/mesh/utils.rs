use crate::identity::{self, IdentityKeypair};
use crate::mesh::types::HandshakePayload;
use crate::types::{MachineId, NetError};
use anyhow::Result;
use snow::params::NoiseParams;

pub const PROTOCOL_VERSION: u8 = 1;

lazy_static::lazy_static! {
    static ref PARAMS: NoiseParams = "Noise_XX_25519_ChaChaPoly_BLAKE2s"
                                        .parse()
                                        .expect("mesh: couldn't build noise params?");
}

pub fn build_initiator() -> Result<(snow::HandshakeState, Vec<u8>)> {
    let builder: snow::Builder<'_> = snow::Builder::new(PARAMS.clone());
    let keypair = builder.generate_keypair()?;
    let state = builder
        .local_private_key(&keypair.private)
        .build_initiator()?;
    Ok((state, keypair.public))
}

pub fn build_responder() -> Result<(snow::HandshakeState, Vec<u8>)> {
    let builder: snow::Builder<'_> = snow::Builder::new(PARAMS.clone());
    let keypair = builder.generate_keypair()?;
    let state = builder
        .local_private_key(&keypair.private)
        .build_responder()?;
    Ok((state, keypair.public))
}

pub fn make_handshake_payload(
    keypair: &IdentityKeypair,
    noise_static_key: &[u8],
) -> HandshakePayload {
    HandshakePayload {
        protocol_version: PROTOCOL_VERSION,
        machine_id: keypair.peer_id(),
        public_key: keypair.public_key(),
        signature: keypair.sign(noise_static_key),
    }
}

/// The peer's identity key must sign the noise static key it is using, and
/// the machine id must be derived from that identity key. Anything else is
/// an impersonation attempt and kills the connection.
pub fn validate_handshake(
    payload: &HandshakePayload,
    their_static_key: &[u8],
) -> Result<MachineId, NetError> {
    if payload.protocol_version != PROTOCOL_VERSION {
        return Err(NetError::Transport("handshake protocol version mismatch".into()));
    }
    if identity::peer_id_from_public_key(&payload.public_key) != payload.machine_id {
        return Err(NetError::SignatureInvalid);
    }
    if !identity::verify(&payload.public_key, their_static_key, &payload.signature) {
        return Err(NetError::SignatureInvalid);
    }
    Ok(payload.machine_id.clone())
}
