use anyhow::Result;

/// Asymmetric session-key handling for a round.
///
/// The on-chain weights hash is authoritative, so the default session
/// performs no real cryptography; the trait is the seam where an
/// encrypting session would plug in.
pub trait SessionCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
    fn public_key_bytes(&self) -> Vec<u8>;
}

/// Identity-transform session: decryption returns the input unchanged.
pub struct PlainSession {
    public_key: Vec<u8>,
}

impl PlainSession {
    /// The public key arrives as the opaque string the UI handed to the
    /// `train` command; hex is decoded, anything else is kept verbatim.
    pub fn new(public_key: &str) -> Self {
        let trimmed = public_key.strip_prefix("0x").unwrap_or(public_key);
        let public_key = hex::decode(trimmed).unwrap_or_else(|_| public_key.as_bytes().to_vec());
        Self { public_key }
    }
}

impl SessionCipher for PlainSession {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_session_decrypt_is_identity() {
        let session = PlainSession::new("deadbeef");
        assert_eq!(session.decrypt(b"weights").unwrap(), b"weights");
        assert_eq!(session.public_key_bytes(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn non_hex_keys_are_kept_verbatim() {
        let session = PlainSession::new("not hex!");
        assert_eq!(session.public_key_bytes(), b"not hex!".to_vec());
    }
}
