//! Long-lived Ed25519 node identities and ephemeral X25519 key agreement.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

pub const PUBLIC_KEY_SIZE: usize = 32;
/// Private representation: seed scalar followed by the public point.
pub const PRIVATE_KEY_SIZE: usize = 64;
pub const SIGNATURE_SIZE: usize = 64;
/// Unpadded base64 of a 32-byte public key is always exactly this long.
pub const PUBLIC_KEY_BASE64_LEN: usize = 43;
/// On-disk private key blob: the 64-byte private representation followed by
/// the 32-byte public key. Historical format, kept for compatibility.
pub const KEY_FILE_SIZE: usize = 96;

pub const ECDH_SIZE: usize = 32;
pub const ECDH_SHARED_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key size {0}, expected {PUBLIC_KEY_BASE64_LEN}")]
    InvalidBase64Length(usize),
    #[error("invalid base64 encoding")]
    InvalidBase64,
    #[error("non-contributory ECDH shared secret")]
    WeakSharedSecret,
}

/// Signature size in bytes.
pub const fn signature_size() -> usize {
    SIGNATURE_SIZE
}

/// A node's long-lived signing identity.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Fresh keypair from 32 bytes of OS randomness.
    pub fn generate() -> Self {
        Keypair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey {
            verifying: self.signing.verifying_key(),
        }
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(msg).to_bytes()
    }

    pub fn from_private_bytes(bytes: &[u8; PRIVATE_KEY_SIZE]) -> Result<Self, CryptoError> {
        let signing =
            SigningKey::from_keypair_bytes(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Keypair { signing })
    }

    pub fn to_private_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.signing.to_keypair_bytes()
    }

    /// Encodes the historical 96-byte private key blob.
    pub fn to_key_file(&self) -> [u8; KEY_FILE_SIZE] {
        let mut out = [0u8; KEY_FILE_SIZE];
        out[..PRIVATE_KEY_SIZE].copy_from_slice(&self.to_private_bytes());
        out[PRIVATE_KEY_SIZE..].copy_from_slice(&self.public().to_bytes());
        out
    }

    /// Decodes the historical 96-byte private key blob. The trailing public
    /// key must match the one embedded in the private representation.
    pub fn from_key_file(blob: &[u8; KEY_FILE_SIZE]) -> Result<Self, CryptoError> {
        let mut private = [0u8; PRIVATE_KEY_SIZE];
        private.copy_from_slice(&blob[..PRIVATE_KEY_SIZE]);
        let keypair = Self::from_private_bytes(&private)?;
        if blob[PRIVATE_KEY_SIZE..] != keypair.public().to_bytes() {
            return Err(CryptoError::InvalidPrivateKey);
        }
        Ok(keypair)
    }
}

/// A peer's public signing identity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PublicKey {
    verifying: VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, CryptoError> {
        let verifying =
            VerifyingKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(PublicKey { verifying })
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.verifying.to_bytes()
    }

    /// Parses the 43-character unpadded base64 form; any other length is an
    /// error.
    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        if s.len() != PUBLIC_KEY_BASE64_LEN {
            return Err(CryptoError::InvalidBase64Length(s.len()));
        }
        let raw = STANDARD_NO_PAD
            .decode(s)
            .map_err(|_| CryptoError::InvalidBase64)?;
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            raw.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(self.to_bytes())
    }

    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(sig) else {
            return false;
        };
        self.verifying.verify(msg, &sig).is_ok()
    }

    /// Short hex prefix for logging.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.to_bytes()[..8])
    }
}

/// One-shot Diffie-Hellman: the state returned by `generate_public` is
/// consumed by `compute_shared`.
pub trait Ecdh: Sized {
    fn generate_public(pubkey: &mut [u8; ECDH_SIZE]) -> Self;
    fn compute_shared(
        self,
        peer: &[u8; ECDH_SIZE],
        shared: &mut [u8; ECDH_SHARED_SIZE],
    ) -> Result<(), CryptoError>;
}

/// X25519 ephemeral agreement.
pub struct X25519 {
    secret: x25519_dalek::EphemeralSecret,
}

impl Ecdh for X25519 {
    fn generate_public(pubkey: &mut [u8; ECDH_SIZE]) -> Self {
        let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        *pubkey = x25519_dalek::PublicKey::from(&secret).to_bytes();
        X25519 { secret }
    }

    fn compute_shared(
        self,
        peer: &[u8; ECDH_SIZE],
        shared: &mut [u8; ECDH_SHARED_SIZE],
    ) -> Result<(), CryptoError> {
        let peer = x25519_dalek::PublicKey::from(*peer);
        let secret = self.secret.diffie_hellman(&peer);
        if !secret.was_contributory() {
            return Err(CryptoError::WeakSharedSecret);
        }
        shared.copy_from_slice(secret.as_bytes());
        Ok(())
    }
}
