//! Registration and session bookkeeping.
//!
//! A peer asks for a challenge, signs `value ‖ nonce` with the key of the
//! address it registers, and receives an access/refresh token pair. Every
//! session has a version counter in the database; tokens carry the
//! version they were issued at, and a refresh moves the counter forward
//! with a compare-and-swap, which revokes the previous pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use tessel_shared::crypto::random_token;
use tessel_shared::models::{Cafe, CafeClient, CafeSession};
use tessel_shared::protocol::{CafeNonce, CafeRefreshSession, CafeRegistration};
use tessel_shared::{verify, Address, Signer};
use tessel_store::SharedDatabase;

use crate::config::ServerConfig;
use crate::error::{lock_db, ServerError};
use crate::tokens::{Claims, TokenIssuer, TokenKind};

/// How long an issued challenge stays answerable.
const NONCE_TTL: Duration = Duration::from_secs(300);

const SESSION_TYPE: &str = "ed25519-bearer";

#[derive(Debug, Clone)]
struct PendingNonce {
    address: Address,
    issued: Instant,
}

pub struct Registrar {
    db: SharedDatabase,
    tokens: TokenIssuer,
    cafe: Cafe,
    open: bool,
    access_ttl: Duration,
    refresh_ttl: Duration,
    nonces: RwLock<HashMap<String, PendingNonce>>,
}

impl Registrar {
    pub fn new(db: SharedDatabase, signer: Arc<dyn Signer>, cafe: Cafe, config: &ServerConfig) -> Self {
        Self {
            db,
            tokens: TokenIssuer::new(signer),
            cafe,
            open: config.registration_open,
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            nonces: RwLock::new(HashMap::new()),
        }
    }

    pub fn cafe(&self) -> &Cafe {
        &self.cafe
    }

    /// Issue a single-use nonce bound to `address`.
    pub async fn challenge(&self, address: Address) -> CafeNonce {
        let value = random_token();
        self.nonces.write().await.insert(
            value.clone(),
            PendingNonce {
                address,
                issued: Instant::now(),
            },
        );
        debug!(address = %address.short(), "challenge issued");
        CafeNonce { value }
    }

    pub async fn register(
        &self,
        peer: &Address,
        reg: &CafeRegistration,
    ) -> Result<CafeSession, ServerError> {
        let token_id = if self.open {
            None
        } else {
            Some(self.check_registration_token(&reg.token)?)
        };

        // the nonce is spent whether or not the proof holds
        let pending = self
            .nonces
            .write()
            .await
            .remove(&reg.value)
            .ok_or_else(|| ServerError::AuthenticationFailed("unknown nonce".into()))?;
        if pending.address != reg.address {
            return Err(ServerError::AuthenticationFailed(
                "nonce was issued to another address".into(),
            ));
        }
        if pending.issued.elapsed() > NONCE_TTL {
            return Err(ServerError::AuthenticationFailed("nonce expired".into()));
        }

        let payload = CafeRegistration::signed_payload(&reg.value, &reg.nonce);
        if !verify(&reg.address, &payload, &reg.sig) {
            warn!(address = %reg.address.short(), "registration signature rejected");
            return Err(ServerError::AuthenticationFailed("bad signature".into()));
        }

        let sid = random_token();
        {
            let db = lock_db(&self.db)?;
            let now = Utc::now();
            let created = db.get_cafe_client(peer)?.map(|c| c.created).unwrap_or(now);
            db.upsert_cafe_client(&CafeClient {
                id: *peer,
                address: reg.address,
                token: token_id,
                created,
                seen: now,
            })?;
            db.create_client_session(&sid, peer, 1)?;
        }

        info!(peer = %peer.short(), address = %reg.address.short(), "client registered");
        self.issue_session(sid, *peer, 1)
    }

    /// Rotate a token pair. The pair must belong to the same session
    /// version, and only one rotation per version can succeed.
    pub async fn refresh(
        &self,
        peer: &Address,
        req: &CafeRefreshSession,
    ) -> Result<CafeSession, ServerError> {
        let refresh = self.tokens.decode(&req.refresh)?;
        if refresh.kind != TokenKind::Refresh || refresh.sub != *peer {
            return Err(ServerError::Forbidden("not a refresh token for this peer".into()));
        }
        if refresh.exp <= Utc::now().timestamp() {
            return Err(ServerError::SessionExpired);
        }

        let access = self.tokens.decode(&req.access)?;
        if access.kind != TokenKind::Access
            || access.sid != refresh.sid
            || access.ver != refresh.ver
            || access.sub != refresh.sub
        {
            return Err(ServerError::Forbidden("access and refresh tokens do not match".into()));
        }

        {
            let db = lock_db(&self.db)?;
            match db.client_session_version(&refresh.sid)? {
                Some((client, ver)) if client == *peer && ver == refresh.ver => {}
                Some(_) => return Err(ServerError::Unauthorized("refresh token revoked".into())),
                None => return Err(ServerError::Unauthorized("unknown session".into())),
            }
            if !db.bump_client_session(&refresh.sid, refresh.ver)? {
                return Err(ServerError::Unauthorized("session already rotated".into()));
            }
            db.touch_cafe_client(peer, Utc::now())?;
        }

        debug!(peer = %peer.short(), version = refresh.ver + 1, "session refreshed");
        self.issue_session(refresh.sid, *peer, refresh.ver + 1)
    }

    /// Resolve an access token presented by `peer` to its client record.
    pub fn authenticate(&self, peer: &Address, token: &str) -> Result<CafeClient, ServerError> {
        if token.is_empty() {
            return Err(ServerError::Unauthorized("missing token".into()));
        }
        let claims = self.tokens.decode(token)?;
        if claims.kind != TokenKind::Access || claims.sub != *peer {
            return Err(ServerError::Forbidden("token not issued to this peer".into()));
        }
        if claims.exp <= Utc::now().timestamp() {
            return Err(ServerError::Unauthorized("access token expired".into()));
        }

        let db = lock_db(&self.db)?;
        match db.client_session_version(&claims.sid)? {
            Some((client, ver)) if client == *peer && ver == claims.ver => {}
            Some(_) => return Err(ServerError::Unauthorized("access token revoked".into())),
            None => return Err(ServerError::Unauthorized("unknown session".into())),
        }
        db.get_cafe_client(peer)?
            .ok_or_else(|| ServerError::Forbidden("client not found".into()))
    }

    /// Mint a registration token. Only its digest is stored; the token
    /// itself is returned once.
    pub fn mint_registration_token(&self) -> Result<(String, String), ServerError> {
        let id = random_token();
        let token = random_token();
        let digest = blake3::hash(token.as_bytes());
        lock_db(&self.db)?.add_registration_token(&id, digest.as_bytes())?;
        info!(id = %id, "registration token minted");
        Ok((id, token))
    }

    pub async fn purge_expired_nonces(&self) {
        let mut nonces = self.nonces.write().await;
        let before = nonces.len();
        nonces.retain(|_, n| n.issued.elapsed() <= NONCE_TTL);
        let purged = before - nonces.len();
        if purged > 0 {
            debug!(purged, "expired nonces purged");
        }
    }

    /// Id of the stored token matching `token`.
    fn check_registration_token(&self, token: &str) -> Result<String, ServerError> {
        let digest = blake3::hash(token.as_bytes());
        let stored = lock_db(&self.db)?.registration_tokens()?;

        let mut found = None;
        for (id, candidate) in stored {
            if bool::from(digest.as_bytes().as_slice().ct_eq(candidate.as_slice())) {
                found = Some(id);
            }
        }
        found.ok_or_else(|| ServerError::AuthenticationFailed("invalid registration token".into()))
    }

    fn issue_session(&self, sid: String, subject: Address, ver: u64) -> Result<CafeSession, ServerError> {
        let now = Utc::now();
        let exp = now + chrono::Duration::from_std(self.access_ttl).unwrap_or(chrono::Duration::days(7));
        let rexp =
            now + chrono::Duration::from_std(self.refresh_ttl).unwrap_or(chrono::Duration::days(28));

        let access = self.tokens.issue(&Claims {
            sid: sid.clone(),
            sub: subject,
            kind: TokenKind::Access,
            ver,
            exp: exp.timestamp(),
        })?;
        let refresh = self.tokens.issue(&Claims {
            sid: sid.clone(),
            sub: subject,
            kind: TokenKind::Refresh,
            ver,
            exp: rexp.timestamp(),
        })?;

        Ok(CafeSession {
            id: sid,
            access,
            exp,
            refresh,
            rexp,
            subject,
            session_type: SESSION_TYPE.to_string(),
            cafe: self.cafe.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_shared::Identity;
    use tessel_store::Database;

    fn cafe(identity: &Identity) -> Cafe {
        Cafe {
            peer: identity.address(),
            address: identity.address(),
            api: "v0".into(),
            protocol: "/tessel/cafe/1.0.0".into(),
            node: "test".into(),
            url: "http://127.0.0.1:40601".into(),
            swarm: Vec::new(),
        }
    }

    fn registrar(config: &ServerConfig) -> Registrar {
        let identity = Identity::generate();
        let db = Database::open_in_memory().unwrap().shared();
        Registrar::new(db, Arc::new(identity.clone()), cafe(&identity), config)
    }

    async fn register(registrar: &Registrar, peer: &Identity, token: &str) -> Result<CafeSession, ServerError> {
        let nonce = registrar.challenge(peer.address()).await;
        let payload = CafeRegistration::signed_payload(&nonce.value, "client-nonce");
        let reg = CafeRegistration {
            address: peer.address(),
            value: nonce.value,
            nonce: "client-nonce".into(),
            sig: Signer::sign(peer, &payload).unwrap(),
            token: token.into(),
        };
        registrar.register(&peer.address(), &reg).await
    }

    #[tokio::test]
    async fn test_register_then_authenticate() {
        let registrar = registrar(&ServerConfig::default());
        let peer = Identity::generate();

        let session = register(&registrar, &peer, "").await.unwrap();
        assert!(session.exp > Utc::now());
        assert_eq!(session.subject, peer.address());

        let client = registrar.authenticate(&peer.address(), &session.access).unwrap();
        assert_eq!(client.id, peer.address());

        // refresh tokens are not access tokens
        assert!(registrar.authenticate(&peer.address(), &session.refresh).is_err());
        // tokens are bound to their peer
        let other = Identity::generate();
        assert!(matches!(
            registrar.authenticate(&other.address(), &session.access),
            Err(ServerError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_nonce_is_single_use_and_bound() {
        let registrar = registrar(&ServerConfig::default());
        let peer = Identity::generate();
        let nonce = registrar.challenge(peer.address()).await;
        let payload = CafeRegistration::signed_payload(&nonce.value, "n");
        let mut reg = CafeRegistration {
            address: peer.address(),
            value: nonce.value.clone(),
            nonce: "n".into(),
            sig: Signer::sign(&peer, &payload).unwrap(),
            token: String::new(),
        };

        // wrong address burns the nonce
        let intruder = Identity::generate();
        reg.address = intruder.address();
        assert!(matches!(
            registrar.register(&intruder.address(), &reg).await,
            Err(ServerError::AuthenticationFailed(_))
        ));
        reg.address = peer.address();
        assert!(registrar.register(&peer.address(), &reg).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_signature_fails_authentication() {
        let registrar = registrar(&ServerConfig::default());
        let peer = Identity::generate();
        let nonce = registrar.challenge(peer.address()).await;
        let reg = CafeRegistration {
            address: peer.address(),
            value: nonce.value,
            nonce: "n".into(),
            sig: Signer::sign(&peer, b"something else").unwrap(),
            token: String::new(),
        };
        assert!(matches!(
            registrar.register(&peer.address(), &reg).await,
            Err(ServerError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_revokes_previous_pair() {
        let registrar = registrar(&ServerConfig::default());
        let peer = Identity::generate();
        let first = register(&registrar, &peer, "").await.unwrap();

        let req = CafeRefreshSession {
            access: first.access.clone(),
            refresh: first.refresh.clone(),
        };
        let second = registrar.refresh(&peer.address(), &req).await.unwrap();
        assert_ne!(second.access, first.access);
        assert_eq!(second.id, first.id);

        assert!(matches!(
            registrar.authenticate(&peer.address(), &first.access),
            Err(ServerError::Unauthorized(_))
        ));
        assert!(registrar.authenticate(&peer.address(), &second.access).is_ok());

        // the old pair cannot rotate again
        assert!(matches!(
            registrar.refresh(&peer.address(), &req).await,
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_refresh_token() {
        let config = ServerConfig {
            refresh_ttl: Duration::from_secs(0),
            ..ServerConfig::default()
        };
        let registrar = registrar(&config);
        let peer = Identity::generate();
        let session = register(&registrar, &peer, "").await.unwrap();

        let req = CafeRefreshSession {
            access: session.access,
            refresh: session.refresh,
        };
        assert!(matches!(
            registrar.refresh(&peer.address(), &req).await,
            Err(ServerError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_closed_registration_requires_token() {
        let config = ServerConfig {
            registration_open: false,
            ..ServerConfig::default()
        };
        let registrar = registrar(&config);
        let peer = Identity::generate();

        assert!(matches!(
            register(&registrar, &peer, "guess").await,
            Err(ServerError::AuthenticationFailed(_))
        ));

        let (id, token) = registrar.mint_registration_token().unwrap();
        register(&registrar, &peer, &token).await.unwrap();
        let client = registrar
            .db
            .lock()
            .unwrap()
            .get_cafe_client(&peer.address())
            .unwrap()
            .unwrap();
        assert_eq!(client.token, Some(id));
    }
}
