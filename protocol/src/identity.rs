use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::PeerId;

/// File under the node config directory holding the raw 32-byte secret key.
const IDENTITY_FILE: &str = "identity.key";

/// Length of the derived peer id in hex characters.
const PEER_ID_LEN: usize = 40;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity file is corrupt: expected 32 bytes, found {0}")]
    Corrupt(usize),
    #[error("invalid peer public key")]
    BadPublicKey,
    #[error("envelope signature rejected")]
    BadSignature,
}

/// A node's stable cryptographic identity.
///
/// Generated once at first launch and persisted; the peer id is derived
/// deterministically from the public key, so restarts keep the same id.
#[derive(Debug)]
pub struct PeerIdentity {
    signing: SigningKey,
    peer_id: PeerId,
}

impl PeerIdentity {
    /// Load the identity from `dir`, generating and persisting a fresh one
    /// if no key file exists. A key file of the wrong size is an error,
    /// never silently regenerated.
    pub fn load_or_generate(dir: &Path) -> Result<Self, IdentityError> {
        let path = key_path(dir);
        if path.exists() {
            let bytes = fs::read(&path)?;
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::Corrupt(bytes.len()))?;
            return Ok(Self::from_secret(SigningKey::from_bytes(&secret)));
        }

        let signing = SigningKey::generate(&mut OsRng);
        fs::create_dir_all(dir)?;
        fs::write(&path, signing.to_bytes())?;
        restrict_permissions(&path)?;
        tracing::info!(path = %path.display(), "Generated new peer identity");
        Ok(Self::from_secret(signing))
    }

    fn from_secret(signing: SigningKey) -> Self {
        let peer_id = derive_peer_id(&signing.verifying_key());
        Self { signing, peer_id }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign an overlay envelope body.
    pub fn sign(&self, body: &[u8]) -> [u8; 64] {
        self.signing.sign(body).to_bytes()
    }
}

/// Verify that `body` was signed by the holder of `public_key` and that the
/// claimed peer id is the one the key derives to.
pub fn verify_envelope(
    claimed_peer_id: &str,
    public_key: &[u8],
    signature: &[u8],
    body: &[u8],
) -> Result<(), IdentityError> {
    let key_bytes: [u8; 32] = public_key
        .try_into()
        .map_err(|_| IdentityError::BadPublicKey)?;
    let verifying =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| IdentityError::BadPublicKey)?;
    if derive_peer_id(&verifying) != claimed_peer_id {
        return Err(IdentityError::BadPublicKey);
    }
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::BadSignature)?;
    verifying
        .verify(body, &signature)
        .map_err(|_| IdentityError::BadSignature)
}

fn derive_peer_id(key: &VerifyingKey) -> PeerId {
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(digest)[..PEER_ID_LEN].to_string()
}

fn key_path(dir: &Path) -> PathBuf {
    dir.join(IDENTITY_FILE)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = PeerIdentity::load_or_generate(dir.path()).unwrap();
        let second = PeerIdentity::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.peer_id().len(), PEER_ID_LEN);
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(key_path(dir.path()), b"short").unwrap();
        match PeerIdentity::load_or_generate(dir.path()) {
            Err(IdentityError::Corrupt(5)) => {}
            other => panic!("expected Corrupt(5), got {other:?}"),
        }
    }

    #[test]
    fn signed_envelopes_verify() {
        let dir = tempfile::tempdir().unwrap();
        let id = PeerIdentity::load_or_generate(dir.path()).unwrap();
        let body = br#"{"type":"Ping","sender":"x","nonce":1}"#;
        let sig = id.sign(body);
        verify_envelope(id.peer_id(), &id.public_key_bytes(), &sig, body).unwrap();

        // Tampered body must be rejected.
        let tampered = br#"{"type":"Ping","sender":"x","nonce":2}"#;
        assert!(
            verify_envelope(id.peer_id(), &id.public_key_bytes(), &sig, tampered).is_err()
        );
    }

    #[test]
    fn peer_id_must_match_key() {
        let dir = tempfile::tempdir().unwrap();
        let id = PeerIdentity::load_or_generate(dir.path()).unwrap();
        let body = b"hello";
        let sig = id.sign(body);
        let err = verify_envelope("deadbeef", &id.public_key_bytes(), &sig, body);
        assert!(matches!(err, Err(IdentityError::BadPublicKey)));
    }
}
