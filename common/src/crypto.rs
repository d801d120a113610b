//! RSA capability used on the report authentication path.
//!
//! Signatures are SHA-256 over the raw byte buffer, RSA PKCS#1 v1.5.
//! Encryption is PKCS#1 v1.5 with plaintext chunking, so payloads larger
//! than one RSA block round-trip transparently. Keys travel as PKCS#8 PEM.

use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// PKCS#1 v1.5 encryption overhead per block.
const ENCRYPT_PADDING_LEN: usize = 11;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("public key pem: {0}")]
    PublicKeyPem(#[from] rsa::pkcs8::spki::Error),
    #[error("private key pem: {0}")]
    PrivateKeyPem(#[from] rsa::pkcs8::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Generates a fresh RSA private key of the given bit size.
pub fn generate_private_key(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    let mut rng = rand::thread_rng();
    Ok(RsaPrivateKey::new(&mut rng, bits)?)
}

/// Loads a PKCS#8 PEM private key from `path`, generating and persisting a
/// new one when the file does not exist.
pub fn load_or_generate_private_key(
    path: &std::path::Path,
    bits: usize,
) -> Result<RsaPrivateKey, CryptoError> {
    if path.exists() {
        let pem = std::fs::read_to_string(path)?;
        return private_key_from_pem(&pem);
    }

    let key = generate_private_key(bits)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, private_key_to_pem(&key)?)?;
    Ok(key)
}

/// Signs `data` with SHA-256 + PKCS#1 v1.5.
pub fn sign(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(data);
    Ok(key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?)
}

/// Verifies a SHA-256 + PKCS#1 v1.5 signature over `data`.
pub fn verify_sign(key: &RsaPublicKey, signature: &[u8], data: &[u8]) -> Result<(), CryptoError> {
    let digest = Sha256::digest(data);
    Ok(key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)?)
}

/// Encrypts `plaintext` under `key`, chunking so arbitrary lengths fit.
pub fn encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut rng = rand::thread_rng();
    let chunk_len = key.size() - ENCRYPT_PADDING_LEN;
    let mut out = Vec::with_capacity(plaintext.len() + key.size());
    for chunk in plaintext.chunks(chunk_len) {
        out.extend(key.encrypt(&mut rng, Pkcs1v15Encrypt, chunk)?);
    }
    Ok(out)
}

/// Decrypts a chunked PKCS#1 v1.5 ciphertext produced by [`encrypt`].
pub fn decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let block_len = key.size();
    let mut out = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks(block_len) {
        out.extend(key.decrypt(Pkcs1v15Encrypt, chunk)?);
    }
    Ok(out)
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    Ok(key.to_public_key_pem(LineEnding::LF)?)
}

pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    Ok(RsaPublicKey::from_public_key_pem(pem)?)
}

pub fn private_key_to_pem(key: &RsaPrivateKey) -> Result<String, CryptoError> {
    Ok(key.to_pkcs8_pem(LineEnding::LF)?.to_string())
}

pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    Ok(RsaPrivateKey::from_pkcs8_pem(pem)?)
}
