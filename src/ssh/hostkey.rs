//! ed25519 host keys
//!
//! Keys are stored in the OpenSSH private key format (`ssh-key`); signing
//! and verification go through `ring`.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use bytes::BytesMut;
use rand::rngs::OsRng;
use ring::signature::{ED25519, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use sha2::{Digest, Sha256};
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use std::fmt;
use std::path::Path;

use super::wire::{Reader, put_string};

/// The only host key algorithm spoken
pub const ALGORITHM: &str = "ssh-ed25519";

/// A server host key
pub struct HostKey {
    private: PrivateKey,
    keypair: Ed25519KeyPair,
}

impl HostKey {
    /// Load an unencrypted OpenSSH ed25519 private key
    pub fn load(path: &Path) -> Result<Self> {
        let private = PrivateKey::read_openssh_file(path)?;
        if private.is_encrypted() {
            return Err(Error::Config(format!(
                "Host key {} is passphrase protected",
                path.display()
            )));
        }
        Self::from_private(private)
    }

    /// Generate a fresh key
    pub fn generate() -> Result<Self> {
        let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
        Self::from_private(private)
    }

    fn from_private(private: PrivateKey) -> Result<Self> {
        let ed25519 = private.key_data().ed25519().ok_or_else(|| {
            Error::Config(format!(
                "Unsupported host key algorithm {}, expected ed25519",
                private.algorithm()
            ))
        })?;
        let seed = ed25519.private.to_bytes();
        let keypair = Ed25519KeyPair::from_seed_unchecked(&seed)
            .map_err(|e| Error::Config(format!("Invalid ed25519 host key: {}", e)))?;
        Ok(Self { private, keypair })
    }

    /// Write the key in OpenSSH format
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        self.private.write_openssh_file(path, LineEnding::LF)?;
        Ok(())
    }

    /// Wire encoding of the public key (`string "ssh-ed25519" || string key`)
    pub fn public_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(51);
        put_string(&mut buf, ALGORITHM.as_bytes());
        put_string(&mut buf, self.keypair.public_key().as_ref());
        buf.to_vec()
    }

    /// `SHA256:...` fingerprint as printed by `ssh-keygen -l`
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_blob())
    }

    /// OpenSSH `authorized_keys` / `known_hosts` style public key line
    pub fn public_openssh(&self) -> Result<String> {
        Ok(self.private.public_key().to_openssh()?)
    }

    /// Sign `data`, returning the wire-encoded signature blob
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature = self.keypair.sign(data);
        let mut buf = BytesMut::with_capacity(83);
        put_string(&mut buf, ALGORITHM.as_bytes());
        put_string(&mut buf, signature.as_ref());
        buf.to_vec()
    }
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Fingerprint of a wire-encoded public key blob
pub fn fingerprint(public_blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(public_blob)))
}

/// Verify an `ssh-ed25519` signature blob made by `public_blob` over `data`
pub fn verify(public_blob: &[u8], data: &[u8], signature_blob: &[u8]) -> Result<()> {
    let mut key = Reader::new(public_blob);
    if key.string()? != ALGORITHM.as_bytes() {
        return Err(Error::Protocol("unexpected host key type".to_string()));
    }
    let public = key.string()?;

    let mut sig = Reader::new(signature_blob);
    if sig.string()? != ALGORITHM.as_bytes() {
        return Err(Error::Protocol("unexpected signature type".to_string()));
    }
    let signature = sig.string()?;

    UnparsedPublicKey::new(&ED25519, public)
        .verify(data, signature)
        .map_err(|_| Error::Protocol("host key signature verification failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sign_and_verify() {
        let key = HostKey::generate().unwrap();
        let blob = key.public_blob();
        let sig = key.sign(b"exchange hash");
        verify(&blob, b"exchange hash", &sig).unwrap();
        assert!(verify(&blob, b"other data", &sig).is_err());
    }

    #[test]
    fn test_fingerprint_matches_ssh_key() {
        let key = HostKey::generate().unwrap();
        let expected = key
            .private
            .public_key()
            .fingerprint(ssh_key::HashAlg::Sha256)
            .to_string();
        assert_eq!(key.fingerprint(), expected);
    }

    #[test]
    fn test_write_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("ssh_host_ed25519_key");

        let key = HostKey::generate().unwrap();
        key.write(&path).unwrap();

        let loaded = HostKey::load(&path).unwrap();
        assert_eq!(loaded.fingerprint(), key.fingerprint());
        assert!(loaded.public_openssh().unwrap().starts_with("ssh-ed25519 "));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(HostKey::load(&dir.path().join("absent")).is_err());
    }
}
