//! # Seal Pipeline
//!
//! AES-256-CBC encryption of compressed blocks, keyed per file. The
//! content key never leaves the process in the clear: it is sealed
//! with the operator's RSA public key and shipped in the single
//! `AES_DESC` record at the head of the file, together with a SHA-256
//! identifier of the DER public key and the CBC IV.
//!
//! Padding is managed manually (PKCS#7 per sealed block) so one cipher
//! context can chain across all blocks of a file.

mod __test__;

use std::fs;
use std::io;
use std::path::Path;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Block;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::format::{AesDescRecord, AES_BLOCK_LEN, AES_IV_LEN, AES_KEY_HASH_LEN};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const CONTENT_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
  #[error("failed to read key file {path}: {source}")]
  KeyFile { path: String, source: io::Error },
  #[error("cannot parse RSA public key: {0}")]
  BadPublicKey(String),
  #[error("cannot parse RSA private key: {0}")]
  BadPrivateKey(String),
  #[error("RSA operation failed: {0}")]
  Rsa(#[from] rsa::Error),
  #[error("ciphertext length {0} is not a multiple of the AES block size")]
  BadCipherLen(usize),
  #[error("bad PKCS#7 padding")]
  BadPadding,
  #[error("sealed content key has an unexpected length")]
  BadContentKey,
}

/// Write-side cipher for one file: generated content key and IV, the
/// sealed `AES_DESC` record, and the chaining CBC state.
pub struct SealContext {
  enc: Aes256CbcEnc,
  desc: AesDescRecord,
}

impl std::fmt::Debug for SealContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    // never expose cipher state
    f.debug_struct("SealContext").finish_non_exhaustive()
  }
}

impl SealContext {
  /// Load an RSA public key (PKCS#8 PEM, with a PKCS#1 fallback) and
  /// set up a fresh per-file seal.
  pub fn from_public_key_file(path: &Path) -> Result<Self, CryptoError> {
    let pem = fs::read_to_string(path).map_err(|source| CryptoError::KeyFile {
      path: path.display().to_string(),
      source,
    })?;
    let key = RsaPublicKey::from_public_key_pem(&pem)
      .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
      .map_err(|e| CryptoError::BadPublicKey(e.to_string()))?;
    Self::from_public_key(&key)
  }

  pub fn from_public_key(key: &RsaPublicKey) -> Result<Self, CryptoError> {
    let der = key
      .to_public_key_der()
      .map_err(|e| CryptoError::BadPublicKey(e.to_string()))?;
    let mut pubkey_sha256 = [0u8; AES_KEY_HASH_LEN];
    pubkey_sha256.copy_from_slice(&Sha256::digest(der.as_bytes()));

    let mut content_key = [0u8; CONTENT_KEY_LEN];
    OsRng.fill_bytes(&mut content_key);
    let mut iv = [0u8; AES_IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let sealed_key = key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), &content_key)?;
    let enc = Aes256CbcEnc::new(&content_key.into(), &iv.into());

    Ok(Self {
      enc,
      desc: AesDescRecord { pubkey_sha256, sealed_key, iv },
    })
  }

  /// The `AES_DESC` record to emit once, before the first sealed
  /// block.
  pub fn desc(&self) -> &AesDescRecord {
    &self.desc
  }

  /// PKCS#7 pad `data` to a block multiple and encrypt it in place.
  /// The chaining state carries over to the next call, so blocks must
  /// be unsealed in write order.
  pub fn seal(&mut self, data: &mut Vec<u8>) {
    let pad = AES_BLOCK_LEN - data.len() % AES_BLOCK_LEN;
    data.resize(data.len() + pad, pad as u8);
    for chunk in data.chunks_exact_mut(AES_BLOCK_LEN) {
      self.enc.encrypt_block_mut(Block::from_mut_slice(chunk));
    }
  }
}

/// Keyed read side: decrypts `AES` entries in file order. Symmetric to
/// [`SealContext`]; the streaming reader itself stays key-less and
/// skips sealed blocks.
pub struct UnsealContext {
  dec: Aes256CbcDec,
}

impl UnsealContext {
  pub fn new(private_key: &RsaPrivateKey, desc: &AesDescRecord) -> Result<Self, CryptoError> {
    let content_key = private_key.decrypt(Oaep::new::<Sha256>(), &desc.sealed_key)?;
    if content_key.len() != CONTENT_KEY_LEN {
      return Err(CryptoError::BadContentKey);
    }
    let mut key = [0u8; CONTENT_KEY_LEN];
    key.copy_from_slice(&content_key);
    Ok(Self {
      dec: Aes256CbcDec::new(&key.into(), &desc.iv.into()),
    })
  }

  /// Decrypt one `AES` entry payload and strip its PKCS#7 padding.
  pub fn unseal(&mut self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if cipher.is_empty() || cipher.len() % AES_BLOCK_LEN != 0 {
      return Err(CryptoError::BadCipherLen(cipher.len()));
    }
    let mut plain = cipher.to_vec();
    for chunk in plain.chunks_exact_mut(AES_BLOCK_LEN) {
      self.dec.decrypt_block_mut(Block::from_mut_slice(chunk));
    }
    let pad = *plain.last().unwrap_or(&0) as usize;
    if pad == 0 || pad > AES_BLOCK_LEN || pad > plain.len() {
      return Err(CryptoError::BadPadding);
    }
    if !plain[plain.len() - pad..].iter().all(|&b| b == pad as u8) {
      return Err(CryptoError::BadPadding);
    }
    plain.truncate(plain.len() - pad);
    Ok(plain)
  }
}

/// Load an RSA private key from a PKCS#8 PEM file.
pub fn load_private_key_file(path: &Path) -> Result<RsaPrivateKey, CryptoError> {
  let pem = fs::read_to_string(path).map_err(|source| CryptoError::KeyFile {
    path: path.display().to_string(),
    source,
  })?;
  RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|e| CryptoError::BadPrivateKey(e.to_string()))
}
