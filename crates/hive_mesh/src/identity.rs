//! Mesh identity: the Ed25519-backed token a node is known by.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ed25519_dalek::{PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH, Signature, Signer, SigningKey, VerifyingKey};

use crate::error::MeshError;

/// A node's identity on the mesh.
///
/// The public half travels in the handshake and is what peers are keyed by.
/// A token received from the wire only carries the public key and cannot
/// sign. Equality and hashing consider the public key alone, so a remote copy
/// compares equal to the local token that produced it.
#[derive(Clone)]
pub struct MeshToken {
    public_key: VerifyingKey,
    signing_key: Option<Arc<SigningKey>>,
}

impl MeshToken {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let secret: [u8; SECRET_KEY_LENGTH] = rand::random();
        Self::from_secret_bytes(&secret)
    }

    /// Rebuild a local token from secret key bytes the caller persisted.
    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_LENGTH]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self {
            public_key: signing_key.verifying_key(),
            signing_key: Some(Arc::new(signing_key)),
        }
    }

    /// Build a remote (verify-only) token from public key bytes.
    pub fn from_public_key(bytes: &[u8]) -> Result<Self, MeshError> {
        let bytes: &[u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| {
            MeshError::InvalidKey(format!(
                "expected {PUBLIC_KEY_LENGTH} public key bytes, got {}",
                bytes.len()
            ))
        })?;
        let public_key =
            VerifyingKey::from_bytes(bytes).map_err(|e| MeshError::InvalidKey(e.to_string()))?;
        Ok(Self {
            public_key,
            signing_key: None,
        })
    }

    /// The public key bytes sent to peers.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.public_key.to_bytes()
    }

    /// Secret key bytes, for callers that persist their identity.
    pub fn secret_bytes(&self) -> Option<[u8; SECRET_KEY_LENGTH]> {
        self.signing_key.as_ref().map(|key| key.to_bytes())
    }

    /// Whether this token holds a private key.
    pub fn can_sign(&self) -> bool {
        self.signing_key.is_some()
    }

    /// Sign raw bytes with the private key.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, MeshError> {
        let key = self.signing_key.as_ref().ok_or(MeshError::MissingPrivateKey)?;
        Ok(key.sign(data).to_bytes().to_vec())
    }

    /// Verify `signature` over `data` against this token's public key.
    ///
    /// Malformed signatures, weak keys and non-canonical encodings all
    /// verify as `false`.
    pub fn verify(&self, signature: &[u8], data: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.public_key.verify_strict(data, &sig).is_ok(),
            Err(_) => false,
        }
    }

    /// A short hex fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.public_key.as_bytes()[..8])
    }
}

impl PartialEq for MeshToken {
    fn eq(&self, other: &Self) -> bool {
        self.public_key.as_bytes() == other.public_key.as_bytes()
    }
}

impl Eq for MeshToken {}

impl Hash for MeshToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public_key.as_bytes().hash(state);
    }
}

impl fmt::Display for MeshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl fmt::Debug for MeshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshToken")
            .field("public_key", &hex::encode(self.public_key.as_bytes()))
            .field("can_sign", &self.can_sign())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_tokens_differ() {
        let a = MeshToken::generate();
        let b = MeshToken::generate();
        assert_ne!(a, b);
        assert!(a.can_sign());
    }

    #[test]
    fn test_remote_copy_equals_local() {
        let local = MeshToken::generate();
        let remote = MeshToken::from_public_key(&local.public_key_bytes()).unwrap();
        assert_eq!(local, remote);
        assert!(!remote.can_sign());

        let mut set = HashSet::new();
        set.insert(local.clone());
        assert!(set.contains(&remote));
    }

    #[test]
    fn test_sign_and_verify() {
        let local = MeshToken::generate();
        let remote = MeshToken::from_public_key(&local.public_key_bytes()).unwrap();
        let signature = local.sign(b"challenge").unwrap();

        assert!(remote.verify(&signature, b"challenge"));
        assert!(!remote.verify(&signature, b"other challenge"));
        assert!(!MeshToken::generate().verify(&signature, b"challenge"));
    }

    #[test]
    fn test_remote_token_cannot_sign() {
        let remote = MeshToken::from_public_key(&MeshToken::generate().public_key_bytes()).unwrap();
        assert!(matches!(remote.sign(b"x"), Err(MeshError::MissingPrivateKey)));
    }

    #[test]
    fn test_verify_rejects_malformed_signature() {
        let token = MeshToken::generate();
        assert!(!token.verify(&[1, 2, 3], b"data"));
        assert!(!token.verify(&[], b"data"));
    }

    #[test]
    fn test_from_public_key_rejects_wrong_length() {
        assert!(matches!(
            MeshToken::from_public_key(&[0u8; 5]),
            Err(MeshError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_secret_bytes_restore_identity() {
        let original = MeshToken::generate();
        let secret = original.secret_bytes().unwrap();
        let restored = MeshToken::from_secret_bytes(&secret);
        assert_eq!(original, restored);

        let signature = restored.sign(b"nonce").unwrap();
        assert!(original.verify(&signature, b"nonce"));
    }

    #[test]
    fn test_fingerprint_display() {
        let token = MeshToken::generate();
        assert_eq!(format!("{token}").len(), 16);
        assert_eq!(format!("{token}"), token.fingerprint());
    }
}
