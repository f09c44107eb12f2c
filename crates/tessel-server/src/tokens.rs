//! Session tokens.
//!
//! A token is `base64url(claims) "." base64url(sig)`, with the claims
//! bincode-encoded and signed by the cafe key. Tokens carry everything
//! needed to check them except the session's current version, which lives
//! in the database so a refresh can revoke the previous pair.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use tessel_shared::{verify, Address, Signer};

use crate::error::ServerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Session id
    pub sid: String,
    /// Peer the session was issued to
    pub sub: Address,
    pub kind: TokenKind,
    /// Session version the token belongs to
    pub ver: u64,
    /// Expiry, unix seconds
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenIssuer {
    signer: Arc<dyn Signer>,
}

impl TokenIssuer {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }

    pub fn issue(&self, claims: &Claims) -> Result<String, ServerError> {
        let body = bincode::serialize(claims).map_err(|e| ServerError::Internal(e.to_string()))?;
        let sig = self
            .signer
            .sign(&body)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(sig)
        ))
    }

    /// Check the signature and return the claims. Expiry and version are
    /// left to the caller.
    pub fn decode(&self, token: &str) -> Result<Claims, ServerError> {
        let invalid = || ServerError::Forbidden("invalid token".into());

        let (body, sig) = token.split_once('.').ok_or_else(invalid)?;
        let body = URL_SAFE_NO_PAD.decode(body).map_err(|_| invalid())?;
        let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| invalid())?;

        if !verify(&self.signer.address(), &body, &sig) {
            return Err(invalid());
        }
        bincode::deserialize(&body).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_shared::Identity;

    fn claims() -> Claims {
        Claims {
            sid: "s1".into(),
            sub: Address([3u8; 32]),
            kind: TokenKind::Access,
            ver: 1,
            exp: 1_900_000_000,
        }
    }

    #[test]
    fn test_issue_and_decode() {
        let issuer = TokenIssuer::new(Arc::new(Identity::generate()));
        let token = issuer.issue(&claims()).unwrap();
        assert_eq!(issuer.decode(&token).unwrap(), claims());
    }

    #[test]
    fn test_foreign_and_tampered_tokens_rejected() {
        let issuer = TokenIssuer::new(Arc::new(Identity::generate()));
        let other = TokenIssuer::new(Arc::new(Identity::generate()));
        let token = other.issue(&claims()).unwrap();
        assert!(matches!(issuer.decode(&token), Err(ServerError::Forbidden(_))));

        let token = issuer.issue(&claims()).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let mut forged = claims();
        forged.ver = 7;
        let body = URL_SAFE_NO_PAD.encode(bincode::serialize(&forged).unwrap());
        assert!(issuer.decode(&format!("{body}.{sig}")).is_err());
        assert!(issuer.decode("not-a-token").is_err());
    }
}
