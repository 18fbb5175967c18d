//! Identity signatures and parcel envelopes
//!
//! Agents and the server each hold an ML-DSA-65 keypair for message-list
//! signatures and an X25519 keypair for the symmetric envelope. A parcel is
//! sealed with an ephemeral ECDH against the recipient's static exchange key;
//! the derived SHA3-256 key feeds ChaCha20-Poly1305.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use pqcrypto_dilithium::dilithium3 as mldsa;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey as PkTrait, SecretKey as SkTrait};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

pub const MLDSA65_PUBKEY_SIZE: usize = 1952;
pub const MLDSA65_SIG_SIZE: usize = 3309;
pub const MLDSA65_SECRET_SIZE: usize = 4032;

/// Nonce length of the envelope AEAD.
pub const ENVELOPE_NONCE_SIZE: usize = 12;

pub type Hash = [u8; 32];
pub type PublicKey = Vec<u8>;
pub type Signature = Vec<u8>;
pub type ExchangePublic = [u8; 32];

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("envelope encryption failed")]
    Encryption,
    #[error("envelope decryption failed")]
    Decryption,
}

/// ML-DSA-65 identity keypair.
pub struct Keypair {
    pub public: PublicKey,
    secret: mldsa::SecretKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let (pk, sk) = mldsa::keypair();
        Self {
            public: pk.as_bytes().to_vec(),
            secret: sk,
        }
    }

    pub fn from_bytes(public: &[u8], secret: &[u8]) -> Result<Self, CryptoError> {
        if public.len() != MLDSA65_PUBKEY_SIZE {
            return Err(CryptoError::InvalidPublicKey);
        }
        if secret.len() != MLDSA65_SECRET_SIZE {
            return Err(CryptoError::InvalidSecretKey);
        }
        let sk = mldsa::SecretKey::from_bytes(secret).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self {
            public: public.to_vec(),
            secret: sk,
        })
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = mldsa::detached_sign(message, &self.secret);
        sig.as_bytes().to_vec()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> Vec<u8> {
        self.secret.as_bytes().to_vec()
    }
}

pub fn verify(pubkey: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    // Detached ML-DSA-65 signatures are fixed-size; reject the rest before
    // touching the verifier.
    if signature.len() != MLDSA65_SIG_SIZE {
        return Err(CryptoError::InvalidSignature);
    }
    let pk = mldsa::PublicKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = mldsa::DetachedSignature::from_bytes(signature)
        .map_err(|_| CryptoError::InvalidSignature)?;
    mldsa::verify_detached_signature(&sig, message, &pk).map_err(|_| CryptoError::InvalidSignature)
}

pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

/// Sealed parcel payload: ephemeral ECDH half, AEAD nonce, ciphertext.
pub struct SealedEnvelope {
    pub ephemeral_key: ExchangePublic,
    pub nonce: [u8; ENVELOPE_NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` to the holder of `recipient` exchange key.
pub fn seal_to(recipient: &ExchangePublic, plaintext: &[u8]) -> Result<SealedEnvelope, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&X25519Public::from(*recipient));
    let key = sha3(shared.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let mut nonce = [0u8; ENVELOPE_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    Ok(SealedEnvelope {
        ephemeral_key: ephemeral_pub.to_bytes(),
        nonce,
        ciphertext,
    })
}

/// Decrypt an envelope sealed to `secret`'s public half.
pub fn open_with(
    secret: &StaticSecret,
    ephemeral_key: &ExchangePublic,
    nonce: &[u8; ENVELOPE_NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let shared = secret.diffie_hellman(&X25519Public::from(*ephemeral_key));
    let key = sha3(shared.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

pub fn exchange_public(secret: &StaticSecret) -> ExchangePublic {
    X25519Public::from(secret).to_bytes()
}

/// Load or generate the server identity keypair.
///
/// Stored as `identity_public.key` / `identity_secret.key` under `data_dir`.
pub fn load_or_generate_identity(data_dir: &Path) -> io::Result<Keypair> {
    let public_path = data_dir.join("identity_public.key");
    let secret_path = data_dir.join("identity_secret.key");

    if public_path.exists() && secret_path.exists() {
        let public = std::fs::read(&public_path)?;
        let secret = std::fs::read(&secret_path)?;
        let keypair = Keypair::from_bytes(&public, &secret)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        info!("Loaded identity keypair from {:?}", public_path);
        return Ok(keypair);
    }

    let keypair = Keypair::generate();
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&public_path, &keypair.public)?;
    std::fs::write(&secret_path, keypair.secret_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&secret_path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&secret_path, perms)?;
    }

    info!(
        "Generated identity keypair, pubkey: {}",
        hex::encode(&keypair.public[..8])
    );
    Ok(keypair)
}

/// Load or generate the server X25519 exchange key.
///
/// Stored in `data_dir/exchange_key.bin`.
pub fn load_or_generate_exchange(data_dir: &Path) -> io::Result<StaticSecret> {
    let key_path = data_dir.join("exchange_key.bin");

    if key_path.exists() {
        let data = std::fs::read(&key_path)?;
        if data.len() != 32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid exchange key file",
            ));
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&data);
        info!("Loaded exchange key from {:?}", key_path);
        return Ok(StaticSecret::from(secret));
    }

    let secret = StaticSecret::random_from_rng(OsRng);
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&key_path, secret.to_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&key_path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&key_path, perms)?;
    }

    info!(
        "Generated exchange key, pubkey: {}",
        hex::encode(exchange_public(&secret))
    );
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = Keypair::generate();
        let message = b"frontend bundle payload";
        let sig = keypair.sign(message);

        assert!(verify(&keypair.public, message, &sig).is_ok());
        assert!(verify(&keypair.public, b"tampered", &sig).is_err());
        assert!(verify(&keypair.public, message, &sig[..100]).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_wrong_sizes() {
        let keypair = Keypair::generate();
        let secret = keypair.secret_bytes();

        assert!(Keypair::from_bytes(&keypair.public[..10], &secret).is_err());
        assert!(Keypair::from_bytes(&keypair.public, &secret[..16]).is_err());
        assert!(Keypair::from_bytes(&keypair.public, &secret).is_ok());
    }

    #[test]
    fn test_seal_open_round_trip() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = exchange_public(&secret);

        let envelope = seal_to(&public, b"task batch").unwrap();
        let plaintext = open_with(&secret, &envelope.ephemeral_key, &envelope.nonce, &envelope.ciphertext).unwrap();
        assert_eq!(plaintext, b"task batch");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let other = StaticSecret::random_from_rng(OsRng);
        let public = exchange_public(&secret);

        let envelope = seal_to(&public, b"task batch").unwrap();
        let result = open_with(&other, &envelope.ephemeral_key, &envelope.nonce, &envelope.ciphertext);
        assert!(result.is_err());
    }
}
