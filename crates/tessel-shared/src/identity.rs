use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, IdentityError};
use crate::types::Address;

/// Anything that can sign on behalf of an address.
///
/// Blocks, envelopes and registrations are all signed through this trait so
/// that the key material itself can live behind a keystore or an HSM.
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// A peer's Ed25519 identity. The public key is the peer's address.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

/// Serializable format for storing/exporting identity
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn from_export(export: &IdentityExport) -> Self {
        Self::from_secret_bytes(&export.secret_key)
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Load an identity from a raw 32-byte secret key file, creating one
    /// if the file does not exist yet.
    pub fn load_or_generate(path: &std::path::Path) -> Result<Self, IdentityError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let secret: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| IdentityError::InvalidKeyBytes)?;
                Ok(Self::from_secret_bytes(&secret))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
                }
                std::fs::write(path, identity.secret_bytes())
                    .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
                Ok(identity)
            }
            Err(e) => Err(IdentityError::KeyFile(e.to_string())),
        }
    }

    pub fn address(&self) -> Address {
        Address(self.signing_key.verifying_key().to_bytes())
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign_raw(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Derive a local database encryption key from the identity using BLAKE3
    pub fn derive_db_key(&self) -> [u8; 32] {
        crate::crypto::derive_key(crate::constants::KDF_CONTEXT_DB_KEY, self.signing_key.as_bytes())
    }
}

impl Signer for Identity {
    fn address(&self) -> Address {
        Identity::address(self)
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

/// Verify `sig` over `message` against the key behind `address`.
pub fn verify(address: &Address, message: &[u8], sig: &[u8]) -> bool {
    verify_signature(address, message, sig).is_ok()
}

pub fn verify_signature(
    address: &Address,
    message: &[u8],
    sig: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(&address.0).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature = Signature::from_slice(sig).map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate();
        let restored = Identity::from_export(&id.to_export());
        assert_eq!(id.address(), restored.address());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let sig = Signer::sign(&id, b"hello tessel").unwrap();

        assert!(verify(&id.address(), b"hello tessel", &sig));
        assert!(!verify(&id.address(), b"wrong", &sig));
        assert!(!verify(&Identity::generate().address(), b"hello tessel", &sig));
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let id = Identity::generate();
        let sig = Signer::sign(&id, b"msg").unwrap();
        assert!(!verify(&id.address(), b"msg", &sig[..10]));
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = std::env::temp_dir().join(format!("tessel-id-{}", uuid::Uuid::new_v4()));
        let path = dir.join("identity.key");
        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.address(), second.address());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_db_key_derivation_deterministic() {
        let id = Identity::generate();
        assert_eq!(id.derive_db_key(), id.derive_db_key());
    }
}
