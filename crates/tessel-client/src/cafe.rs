//! HTTP client for the cafe API.
//!
//! Every call is one signed envelope posted to the cafe and, except for
//! deliveries, one signed envelope back. Sessions are kept in the local
//! database keyed by cafe peer. Authenticated calls refresh an expired
//! access token before sending and retry once after a refresh when the
//! cafe answers 401.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use tessel_shared::constants::{CAFE_API_VERSION, PEER_HEADER};
use tessel_shared::models::{Cafe, CafeMessage, CafeSession, Contact};
use tessel_shared::protocol::{
    CafeChallenge, CafeCheckMessages, CafeDeleteMessages, CafeDeliverMessage, CafeObject,
    CafePublishContact, CafeRefreshSession, CafeRegistration, CafeStore, CafeStoreThread, Message,
    Payload,
};
use tessel_shared::query::{Query, QueryResults};
use tessel_shared::{open_bytes, seal, take_frame, Address, Cid, Identity, Signer};
use tessel_store::SharedDatabase;

use crate::config::ClientConfig;
use crate::error::{lock_db, ClientError, Result};
use crate::state::SessionStatus;

#[derive(Debug, Deserialize)]
struct CafeInfo {
    peer: String,
    address: String,
    api: String,
    protocol: String,
    node: String,
}

fn unexpected(payload: Option<Payload>) -> ClientError {
    match payload {
        Some(p) => ClientError::UnexpectedResponse(format!("{:?}", p.message_type())),
        None => ClientError::UnexpectedResponse("empty response".into()),
    }
}

pub struct CafeClient {
    identity: Arc<Identity>,
    db: SharedDatabase,
    http: reqwest::Client,
    config: ClientConfig,
    refresh_lock: Mutex<()>,
}

impl CafeClient {
    pub fn new(identity: Arc<Identity>, db: SharedDatabase, config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tessel-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            identity,
            db,
            http,
            config,
            refresh_lock: Mutex::new(()),
        })
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self, cafe: &Address) -> Result<Option<CafeSession>> {
        Ok(lock_db(&self.db)?.get_cafe_session(cafe)?)
    }

    pub fn sessions(&self) -> Result<Vec<CafeSession>> {
        Ok(lock_db(&self.db)?.list_cafe_sessions()?)
    }

    pub fn status(&self, cafe: &Address) -> Result<SessionStatus> {
        Ok(SessionStatus::of(self.session(cafe)?.as_ref(), Utc::now()))
    }

    /// Describe the cafe at `url`.
    pub async fn info(&self, url: &str) -> Result<Cafe> {
        let url = url.trim_end_matches('/');
        let info: CafeInfo = self
            .http
            .get(format!("{url}/info"))
            .timeout(self.config.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let parse = |hex: &str| {
            Address::from_hex(hex)
                .map_err(|e| ClientError::UnexpectedResponse(format!("bad cafe address: {e}")))
        };
        Ok(Cafe {
            peer: parse(&info.peer)?,
            address: parse(&info.address)?,
            api: info.api,
            protocol: info.protocol,
            node: info.node,
            url: url.to_string(),
            swarm: Vec::new(),
        })
    }

    /// Challenge-and-sign registration with the cafe at `url`. `token` is
    /// only needed by cafes that are not open to everyone.
    pub async fn register(&self, url: &str, token: &str) -> Result<CafeSession> {
        let cafe = self.info(url).await?;

        let challenge = Payload::CafeChallenge(CafeChallenge {
            address: self.address(),
        });
        let nonce = match self.request(&cafe, challenge).await? {
            Some(Payload::CafeNonce(nonce)) => nonce,
            other => return Err(unexpected(other)),
        };

        let ours = tessel_shared::crypto::random_token();
        let sig = self
            .identity
            .sign(&CafeRegistration::signed_payload(&nonce.value, &ours))?;
        let registration = Payload::CafeRegistration(CafeRegistration {
            address: self.address(),
            value: nonce.value,
            nonce: ours,
            sig,
            token: token.to_string(),
        });
        let mut session = match self.request(&cafe, registration).await? {
            Some(Payload::CafeSession(session)) => session,
            other => return Err(unexpected(other)),
        };
        if session.cafe.address != cafe.address || session.subject != self.address() {
            return Err(ClientError::UnexpectedResponse(
                "session issued for another cafe or subject".into(),
            ));
        }
        // keep the url that actually answered
        session.cafe.url = cafe.url;

        lock_db(&self.db)?.upsert_cafe_session(&session)?;
        info!(cafe = %cafe.peer.short(), "registered with cafe");
        Ok(session)
    }

    /// Forget the session held with `cafe`.
    pub fn deregister(&self, cafe: &Address) -> Result<bool> {
        Ok(lock_db(&self.db)?.delete_cafe_session(cafe)?)
    }

    /// Rotate the token pair held with `cafe`.
    pub async fn refresh(&self, cafe: &Address) -> Result<CafeSession> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked(cafe).await
    }

    /// Refresh unless another task already replaced `stale_access`.
    async fn refresh_if_stale(&self, cafe: &Address, stale_access: &str) -> Result<CafeSession> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.session(cafe)?.ok_or(ClientError::NotRegistered(*cafe))?;
        if current.access != stale_access && !current.access_expired(Utc::now()) {
            return Ok(current);
        }
        self.refresh_locked(cafe).await
    }

    async fn refresh_locked(&self, cafe: &Address) -> Result<CafeSession> {
        let session = self.session(cafe)?.ok_or(ClientError::NotRegistered(*cafe))?;
        if session.refresh_expired(Utc::now()) {
            self.deregister(cafe)?;
            return Err(ClientError::SessionExpired(*cafe));
        }

        let request = Payload::CafeRefreshSession(CafeRefreshSession {
            access: session.access.clone(),
            refresh: session.refresh.clone(),
        });
        let mut fresh = match self.request(&session.cafe, request).await {
            Ok(Some(Payload::CafeSession(fresh))) => fresh,
            Ok(other) => return Err(unexpected(other)),
            Err(ClientError::Unauthorized(reason)) => {
                warn!(cafe = %cafe.short(), reason = %reason, "refresh rejected, session dropped");
                self.deregister(cafe)?;
                return Err(ClientError::SessionExpired(*cafe));
            }
            Err(e) => return Err(e),
        };
        fresh.cafe.url = session.cafe.url;

        lock_db(&self.db)?.upsert_cafe_session(&fresh)?;
        debug!(cafe = %cafe.short(), "session refreshed");
        Ok(fresh)
    }

    /// Ask which of `cids` the cafe still needs.
    pub async fn store(&self, cafe: &Address, cids: &[Cid]) -> Result<Vec<Cid>> {
        let cids: Vec<String> = cids.iter().map(|c| c.0.clone()).collect();
        match self
            .authed(cafe, |token| {
                Payload::CafeStore(CafeStore {
                    token,
                    cids: cids.clone(),
                })
            })
            .await?
        {
            Some(Payload::CafeObjectList(list)) => Ok(list.cids.into_iter().map(Cid).collect()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn store_object(&self, cafe: &Address, data: &[u8]) -> Result<Cid> {
        let cid = Cid::of(data);
        match self
            .authed(cafe, |token| {
                Payload::CafeObject(CafeObject {
                    token,
                    cid: cid.0.clone(),
                    data: data.to_vec(),
                    node: Vec::new(),
                })
            })
            .await?
        {
            Some(Payload::CafeStored(stored)) if stored.id == cid.0 => Ok(cid),
            other => Err(unexpected(other)),
        }
    }

    /// Pin every object in `objects` the cafe does not have yet.
    pub async fn store_all(&self, cafe: &Address, objects: &[Vec<u8>]) -> Result<usize> {
        let cids: Vec<Cid> = objects.iter().map(|o| Cid::of(o)).collect();
        let missing = self.store(cafe, &cids).await?;
        let mut stored = 0;
        for (cid, data) in cids.iter().zip(objects) {
            if missing.contains(cid) {
                self.store_object(cafe, data).await?;
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Back up an already encrypted thread snapshot.
    pub async fn store_thread(&self, cafe: &Address, id: &str, ciphertext: Vec<u8>) -> Result<()> {
        match self
            .authed(cafe, |token| {
                Payload::CafeStoreThread(CafeStoreThread {
                    token,
                    id: id.to_string(),
                    ciphertext: ciphertext.clone(),
                })
            })
            .await?
        {
            Some(Payload::CafeStored(_)) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Queue object `id` in `client`'s inbox on `cafe`. Needs no session
    /// there.
    pub async fn deliver(&self, cafe: &Cafe, client: Address, id: &Cid) -> Result<()> {
        let deliver = Payload::CafeDeliverMessage(CafeDeliverMessage {
            id: id.0.clone(),
            client,
        });
        match self.request(cafe, deliver).await? {
            None => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn check_messages(&self, cafe: &Address) -> Result<Vec<CafeMessage>> {
        match self
            .authed(cafe, |token| Payload::CafeCheckMessages(CafeCheckMessages { token }))
            .await?
        {
            Some(Payload::CafeMessages(messages)) => Ok(messages.messages),
            other => Err(unexpected(other)),
        }
    }

    /// Delete the page [`check_messages`](Self::check_messages) returned.
    /// `true` means more remain.
    pub async fn delete_messages(&self, cafe: &Address) -> Result<bool> {
        match self
            .authed(cafe, |token| Payload::CafeDeleteMessages(CafeDeleteMessages { token }))
            .await?
        {
            Some(Payload::CafeDeleteMessagesAck(ack)) => Ok(ack.more),
            other => Err(unexpected(other)),
        }
    }

    pub async fn publish_contact(&self, cafe: &Address, contact: &Contact) -> Result<Address> {
        match self
            .authed(cafe, |token| {
                Payload::CafePublishContact(CafePublishContact {
                    token,
                    contact: contact.clone(),
                })
            })
            .await?
        {
            Some(Payload::CafePublishContactAck(ack)) => Ok(ack.id),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch a pinned object from any cafe. The bytes must hash to `cid`.
    pub async fn fetch_object(&self, url: &str, cid: &Cid) -> Result<Option<Vec<u8>>> {
        let url = url.trim_end_matches('/');
        let response = self
            .http
            .get(format!("{url}/cafe/{CAFE_API_VERSION}/object/{cid}"))
            .timeout(self.config.timeout)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let data = response.error_for_status()?.bytes().await?.to_vec();
        if Cid::of(&data) != *cid {
            return Err(ClientError::UnexpectedResponse(format!("object does not hash to {cid}")));
        }
        Ok(Some(data))
    }

    /// Run `query` on `cafe`. Result batches arrive on the returned channel
    /// as the cafe streams them; the channel closes when the cafe is done.
    pub async fn query(
        &self,
        cafe: &Address,
        mut query: Query,
    ) -> Result<mpsc::UnboundedReceiver<QueryResults>> {
        let mut session = self.session(cafe)?.ok_or(ClientError::NotRegistered(*cafe))?;
        if session.access_expired(Utc::now()) {
            session = self.refresh_if_stale(cafe, &session.access).await?;
        }
        query.token = session.access.clone();

        let message = Message::request(Payload::CafeQuery(query), self.next_request_id());
        let body = seal(&message, self.identity.as_ref())?.encode()?;
        let response = self
            .http
            .post(format!("{}/cafe/{CAFE_API_VERSION}/query", session.cafe.url))
            .header(PEER_HEADER, self.address().to_hex())
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cafe_address = session.cafe.address;
        let request_id = message.request_id;
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "query stream broke off");
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);
                loop {
                    let frame = match take_frame(&mut buf) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "bad query frame");
                            return;
                        }
                    };
                    let reply = match open_bytes(&frame, &cafe_address) {
                        Ok(reply) if reply.request_id == request_id => reply,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(error = %e, "dropping unverifiable query frame");
                            continue;
                        }
                    };
                    match reply.payload {
                        Payload::CafeQueryRes(results) => {
                            if tx.send(results).is_err() {
                                return;
                            }
                        }
                        Payload::Error(e) => {
                            warn!(code = e.code, message = %e.message, "cafe refused query");
                            return;
                        }
                        other => debug!(kind = ?other.message_type(), "ignoring query frame"),
                    }
                }
            }
        });
        Ok(rx)
    }

    fn next_request_id(&self) -> i32 {
        rand::random::<i32>() & i32::MAX
    }

    /// Send `build(access_token)` with the session held with `cafe`.
    async fn authed<F>(&self, cafe: &Address, build: F) -> Result<Option<Payload>>
    where
        F: Fn(String) -> Payload,
    {
        let mut session = self.session(cafe)?.ok_or(ClientError::NotRegistered(*cafe))?;
        if session.access_expired(Utc::now()) {
            session = self.refresh_if_stale(cafe, &session.access).await?;
        }

        match self.request(&session.cafe, build(session.access.clone())).await {
            Err(ClientError::Unauthorized(reason)) => {
                debug!(cafe = %cafe.short(), reason = %reason, "access rejected, refreshing");
                let session = self.refresh_if_stale(cafe, &session.access).await?;
                self.request(&session.cafe, build(session.access.clone())).await
            }
            other => other,
        }
    }

    /// One signed request and its verified reply.
    async fn request(&self, cafe: &Cafe, payload: Payload) -> Result<Option<Payload>> {
        let message = Message::request(payload, self.next_request_id());
        let body = seal(&message, self.identity.as_ref())?.encode()?;
        let url = format!("{}/cafe/{CAFE_API_VERSION}/service", cafe.url);

        let mut attempt = 1;
        loop {
            match self.post_once(&url, &body, cafe, message.request_id).await {
                Err(e) if e.is_transient() && attempt < self.config.request_attempts => {
                    let delay = self.config.backoff_for(attempt);
                    debug!(url = %url, attempt, error = %e, ?delay, "cafe request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn post_once(
        &self,
        url: &str,
        body: &[u8],
        cafe: &Cafe,
        request_id: i32,
    ) -> Result<Option<Payload>> {
        let response = self
            .http
            .post(url)
            .timeout(self.config.timeout)
            .header(PEER_HEADER, self.address().to_hex())
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_else(|| status.to_string());
            return Err(ClientError::Cafe {
                code: status.as_u16(),
                message,
            });
        }

        let reply = open_bytes(&response.bytes().await?, &cafe.address)?;
        if reply.request_id != request_id || !reply.is_response {
            return Err(ClientError::UnexpectedResponse("reply does not match request".into()));
        }
        match reply.payload {
            Payload::Error(e) => Err(ClientError::from_cafe(e)),
            payload => Ok(Some(payload)),
        }
    }
}
