//! Session crypto: per-vendor key derivation, payload sealing, the legacy mixing tables.

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Sealed payloads carry their message counter up front, u64 LE.
const COUNTER_PREFIX: usize = 8;

/// Key-derivation scheme a vendor family uses. Declared by the capability
/// profile so the session knows which nonce shape to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyScheme {
    /// Fixed coefficient-matrix mixing plus a hash over the pairing secret.
    LegacyMix,
    /// X25519 agreement against the device's ephemeral public key.
    Agreement,
}

/// Long-lived secret established at bond time and stored by the host.
/// For the agreement scheme it doubles as the local X25519 static secret.
pub struct PairingSecret([u8; 32]);

impl PairingSecret {
    /// Generate a fresh secret, valid for either scheme.
    pub fn generate() -> Self {
        PairingSecret(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PairingSecret(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Public half under the agreement scheme; the device learns it at bond time.
    pub fn public_key(&self) -> [u8; 32] {
        X25519PublicKey::from(&StaticSecret::from(self.0)).to_bytes()
    }
}

/// Nonce material the device sends when a session opens. Its shape selects
/// the derivation scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNonce {
    Legacy([u8; 16]),
    Agreement { ephemeral: [u8; 32], nonce: [u8; 16] },
}

impl DeviceNonce {
    pub fn scheme(&self) -> KeyScheme {
        match self {
            DeviceNonce::Legacy(_) => KeyScheme::LegacyMix,
            DeviceNonce::Agreement { .. } => KeyScheme::Agreement,
        }
    }
}

// Vendor key-mixing tables. The sequence, the matrix, and the row-wise
// combination order must match the device firmware exactly.
const MIX_SEQUENCE: [u8; 16] = [
    0x11, 0x22, 0x33, 0x33, 0x22, 0x11, 0x11, 0x22, 0x33, 0x33, 0x22, 0x11, 0x11, 0x22, 0x33, 0x33,
];

const MIX_COEFFICIENTS: [[u8; 16]; 16] = [
    [2, 1, 1, 1, 4, 2, 1, 1, 2, 2, 4, 2, 4, 4, 16, 8],
    [2, 1, 1, 1, 4, 2, 1, 1, 1, 1, 2, 1, 2, 2, 8, 4],
    [1, 1, 4, 2, 2, 2, 4, 2, 16, 8, 4, 4, 2, 1, 1, 1],
    [1, 1, 4, 2, 1, 1, 2, 1, 8, 4, 2, 2, 2, 1, 1, 1],
    [16, 8, 2, 2, 4, 2, 4, 4, 1, 1, 4, 2, 1, 1, 2, 1],
    [8, 4, 1, 1, 2, 1, 2, 2, 1, 1, 4, 2, 1, 1, 2, 1],
    [2, 2, 4, 2, 4, 4, 16, 8, 2, 1, 1, 1, 4, 2, 1, 1],
    [1, 1, 2, 1, 2, 2, 8, 4, 2, 1, 1, 1, 4, 2, 1, 1],
    [4, 2, 4, 4, 16, 8, 2, 2, 1, 1, 2, 1, 1, 1, 4, 2],
    [2, 1, 2, 2, 8, 4, 1, 1, 1, 1, 2, 1, 1, 1, 4, 2],
    [4, 4, 16, 8, 1, 1, 2, 1, 4, 2, 1, 1, 4, 2, 2, 2],
    [2, 2, 8, 4, 1, 1, 2, 1, 4, 2, 1, 1, 2, 1, 1, 1],
    [1, 1, 2, 1, 1, 1, 4, 2, 4, 4, 16, 8, 2, 2, 4, 2],
    [1, 1, 2, 1, 1, 1, 4, 2, 2, 2, 8, 4, 1, 1, 2, 1],
    [4, 2, 1, 1, 2, 1, 1, 1, 4, 2, 2, 2, 16, 8, 4, 4],
    [4, 2, 1, 1, 2, 1, 1, 1, 2, 1, 1, 1, 8, 4, 2, 2],
];

/// Row-wise weighted sum of the fixed sequence, each row reduced mod 256.
fn legacy_mix() -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, row) in MIX_COEFFICIENTS.iter().enumerate() {
        let sum: u32 = row
            .iter()
            .zip(MIX_SEQUENCE.iter())
            .map(|(c, s)| u32::from(*c) * u32::from(*s))
            .sum();
        out[i] = (sum % 256) as u8;
    }
    out
}

/// Derive the session key for one connection. Deterministic for identical
/// inputs; invalidate and re-derive on reconnect.
pub fn derive_session_key(pairing: &PairingSecret, nonce: &DeviceNonce) -> SessionKeyMaterial {
    let key: [u8; 32] = match nonce {
        DeviceNonce::Legacy(n) => {
            let mut hasher = Sha256::new();
            hasher.update(b"clasp-legacy-session-v1");
            hasher.update(legacy_mix());
            hasher.update(pairing.as_bytes());
            hasher.update(n);
            hasher.finalize().into()
        }
        DeviceNonce::Agreement { ephemeral, nonce } => {
            let shared = StaticSecret::from(*pairing.as_bytes())
                .diffie_hellman(&X25519PublicKey::from(*ephemeral));
            let mut hasher = Sha256::new();
            hasher.update(b"clasp-session-v1");
            hasher.update(shared.to_bytes());
            hasher.update(nonce);
            hasher.finalize().into()
        }
    };
    SessionKeyMaterial {
        key,
        send_counter: 0,
    }
}

/// Key material for one session. Never persisted; the send counter makes
/// every sealed payload distinct.
#[derive(Clone)]
pub struct SessionKeyMaterial {
    key: [u8; 32],
    send_counter: u64,
}

impl SessionKeyMaterial {
    /// Seal a payload: explicit u64 LE counter, then ChaCha20-Poly1305
    /// ciphertext under that counter.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| CryptoError::Key)?;
        let counter = self.send_counter;
        let ciphertext = cipher
            .encrypt(&build_nonce(counter), plaintext)
            .map_err(|_| CryptoError::Seal)?;
        self.send_counter += 1;
        let mut out = Vec::with_capacity(COUNTER_PREFIX + ciphertext.len());
        out.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open a sealed payload using its embedded counter. Stateless with
    /// respect to arrival order; anything tampered, truncated, or sealed
    /// under other key material fails authentication.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < COUNTER_PREFIX {
            return Err(CryptoError::AuthFailed);
        }
        let mut counter_bytes = [0u8; COUNTER_PREFIX];
        counter_bytes.copy_from_slice(&sealed[..COUNTER_PREFIX]);
        let counter = u64::from_le_bytes(counter_bytes);
        let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| CryptoError::Key)?;
        cipher
            .decrypt(&build_nonce(counter), &sealed[COUNTER_PREFIX..])
            .map_err(|_| CryptoError::AuthFailed)
    }
}

fn build_nonce(counter: u64) -> chacha20poly1305::Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce_bytes.into()
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("sealing failed")]
    Seal,
    #[error("payload authentication failed")]
    AuthFailed,
}
