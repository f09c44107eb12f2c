use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query as UrlQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use tessel_shared::constants::PEER_HEADER;
use tessel_shared::protocol::{Message, Payload};
use tessel_shared::{open, write_frame, Address, Cid, Envelope};

use crate::config::ServerConfig;
use crate::error::{lock_db, ServerError};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::service::CafeService;

/// Room for the envelope and request fields around an object's bytes.
const ENVELOPE_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CafeService>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub started: Instant,
}

impl AppState {
    pub fn new(service: Arc<CafeService>, config: Arc<ServerConfig>) -> Self {
        Self {
            service,
            rate_limiter: RateLimiter::from_config(&config),
            config,
            started: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(cafe_info))
        .route("/cafe/v0/service", post(cafe_service))
        .route("/cafe/v0/query", post(cafe_query))
        .route("/cafe/v0/object/:cid", get(object_download))
        .route("/admin/status", get(admin_status))
        .route("/admin/tokens", post(admin_create_token))
        .route("/admin/dead-letters", get(admin_dead_letters))
        .layer(DefaultBodyLimit::max(
            state.config.max_object_size + ENVELOPE_OVERHEAD,
        ))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct CafeInfoResponse {
    name: String,
    peer: String,
    address: String,
    api: String,
    protocol: String,
    node: String,
    url: String,
    registration_open: bool,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    clients: usize,
    queued_messages: usize,
    dead_letters: usize,
    registration_open: bool,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct RegistrationTokenResponse {
    id: String,
    token: String,
}

#[derive(Deserialize)]
struct DeadLetterParams {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct DeadLetter {
    id: String,
    client: String,
    from: String,
    date: chrono::DateTime<chrono::Utc>,
    attempts: u32,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn cafe_info(State(state): State<AppState>) -> Json<CafeInfoResponse> {
    let cafe = state.service.cafe();
    Json(CafeInfoResponse {
        name: state.config.instance_name.clone(),
        peer: cafe.peer.to_hex(),
        address: cafe.address.to_hex(),
        api: cafe.api.clone(),
        protocol: cafe.protocol.clone(),
        node: cafe.node.clone(),
        url: cafe.url.clone(),
        registration_open: state.config.registration_open,
    })
}

/// Identify the caller and open the envelope it signed.
fn open_request(headers: &HeaderMap, body: &[u8]) -> Result<(Address, Message), ServerError> {
    let peer = headers
        .get(PEER_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest(format!("missing {PEER_HEADER} header")))?;
    let peer = Address::from_hex(peer.trim())
        .map_err(|e| ServerError::BadRequest(format!("invalid {PEER_HEADER} header: {e}")))?;

    let envelope = Envelope::decode(body)?;
    let message = open(&envelope, &peer)?;
    Ok((peer, message))
}

fn envelope_response(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response()
}

/// One request envelope in, at most one response envelope out.
async fn cafe_service(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let (peer, message) = open_request(&headers, &body)?;
    debug!(peer = %peer.short(), request = ?message.msg_type, "cafe request");

    match state.service.handle(&peer, message).await {
        Some(reply) => {
            let envelope = state.service.seal(&reply)?;
            Ok(envelope_response(envelope.encode()?))
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Streams `CafeQueryRes` envelopes as length-prefixed frames while the
/// query runs. A rejected query yields a single ERROR frame.
async fn cafe_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let (peer, message) = open_request(&headers, &body)?;
    let request_id = message.request_id;
    let Payload::CafeQuery(query) = message.payload else {
        return Err(ServerError::BadRequest("expected a query".into()));
    };

    let results = match state.service.query(&peer, request_id, query) {
        Ok(results) => results,
        Err(e) => {
            debug!(peer = %peer.short(), error = %e, "query rejected");
            let envelope = state.service.seal(&e.to_message(request_id))?;
            return Ok(envelope_response(write_frame(&envelope.encode()?)));
        }
    };

    let frames = stream::unfold(
        (results, state.service.clone()),
        |(mut results, service): (mpsc::UnboundedReceiver<Message>, Arc<CafeService>)| async move {
            let message = results.recv().await?;
            let frame = match service.seal(&message).and_then(|env| Ok(env.encode()?)) {
                Ok(bytes) => write_frame(&bytes),
                Err(e) => {
                    warn!(error = %e, "failed to seal query results");
                    return None;
                }
            };
            Some((
                Ok::<_, std::convert::Infallible>(Bytes::from(frame)),
                (results, service),
            ))
        },
    );

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(frames),
    )
        .into_response())
}

/// Objects are content addressed and public.
async fn object_download(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Response, ServerError> {
    let data = state.service.objects().get(&Cid(cid)).await?;
    Ok(envelope_response(data))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    if token.len() != expected.len() || token.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }
    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let (clients, (queued, dead)) = {
        let db = lock_db(state.service.db())?;
        (db.count_cafe_clients()?, db.queue_counts()?)
    };

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        clients,
        queued_messages: queued,
        dead_letters: dead,
        registration_open: state.config.registration_open,
        uptime_secs: state.started.elapsed().as_secs(),
    }))
}

/// Mint a token that lets one more peer register on a closed cafe.
async fn admin_create_token(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<RegistrationTokenResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let (id, token) = state.service.registrar().mint_registration_token()?;
    info!(id = %id, "Admin minted registration token");
    Ok(Json(RegistrationTokenResponse { id, token }))
}

async fn admin_dead_letters(
    headers: HeaderMap,
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<DeadLetterParams>,
) -> Result<Json<Vec<DeadLetter>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let limit = params.limit.unwrap_or(100).min(1000);
    let letters = state
        .service
        .relay()
        .dead_letters(limit)?
        .into_iter()
        .map(|q| DeadLetter {
            id: q.message.id,
            client: q.message.client.to_hex(),
            from: q.message.peer.to_hex(),
            date: q.message.date,
            attempts: q.attempts,
        })
        .collect();
    Ok(Json(letters))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use tessel_shared::models::Contact;
    use tessel_shared::protocol::{CafeDeliverMessage, CafePublishContact};
    use tessel_shared::query::{ContactQuery, Query, QueryOptions, QueryPayload};
    use tessel_shared::{open_bytes, seal, take_frame, Identity};

    use crate::service::tests::{register, test_cafe};

    const ADMIN: &str = "admin-secret";

    async fn app(dir: &TempDir, config: ServerConfig) -> (Router, Arc<CafeService>) {
        let config = ServerConfig {
            admin_token: Some(ADMIN.into()),
            ..config
        };
        let (service, _net) = test_cafe(dir, config.clone()).await;
        let service = Arc::new(service);
        let state = AppState::new(service.clone(), Arc::new(config));
        (build_router(state), service)
    }

    fn envelope_request(path: &str, peer: &Identity, payload: Payload) -> Request<Body> {
        let envelope = seal(&Message::request(payload, 4), peer).unwrap();
        Request::post(path)
            .header(PEER_HEADER, peer.address().to_hex())
            .body(Body::from(envelope.encode().unwrap()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_service_endpoint_answers_with_signed_envelope() {
        let dir = TempDir::new().unwrap();
        let (router, service) = app(&dir, ServerConfig::default()).await;
        let phone = Identity::generate();

        let response = router
            .clone()
            .oneshot(envelope_request("/cafe/v0/service", &phone, Payload::Ping))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply = open_bytes(&body_bytes(response).await, &service.cafe().address).unwrap();
        assert_eq!(reply.payload, Payload::Pong);
        assert_eq!(reply.request_id, 4);
        assert!(reply.is_response);

        // deliveries get no reply
        let deliver = Payload::CafeDeliverMessage(CafeDeliverMessage {
            id: "m".into(),
            client: Identity::generate().address(),
        });
        let response = router
            .clone()
            .oneshot(envelope_request("/cafe/v0/service", &phone, deliver))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // an envelope signed by someone other than the named peer
        let mut forged = envelope_request("/cafe/v0/service", &phone, Payload::Ping);
        forged.headers_mut().insert(
            PEER_HEADER,
            Identity::generate().address().to_hex().parse().unwrap(),
        );
        let response = router.oneshot(forged).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_query_endpoint_streams_frames() {
        let dir = TempDir::new().unwrap();
        let (router, service) = app(&dir, ServerConfig::default()).await;
        let phone = Identity::generate();
        let session = register(&service, &phone).await;

        let publish = Message::request(
            Payload::CafePublishContact(CafePublishContact {
                token: session.access.clone(),
                contact: Contact::new(phone.address(), "bob"),
            }),
            1,
        );
        service.handle(&phone.address(), publish).await.unwrap();

        let mut query = Query::new(
            QueryPayload::Contact(ContactQuery {
                id: Some(phone.address()),
                username: None,
            }),
            QueryOptions {
                local_only: true,
                ..QueryOptions::default()
            },
        );
        query.token = session.access.clone();

        let response = router
            .clone()
            .oneshot(envelope_request("/cafe/v0/query", &phone, Payload::CafeQuery(query.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut buf = body_bytes(response).await;
        let mut frames = Vec::new();
        while let Some(frame) = take_frame(&mut buf).unwrap() {
            frames.push(open_bytes(&frame, &service.cafe().address).unwrap());
        }
        assert_eq!(frames.len(), 1);
        let Payload::CafeQueryRes(res) = &frames[0].payload else {
            panic!("expected query results");
        };
        assert_eq!(res.items[0].id, phone.address().to_hex());

        // a bad token comes back as a single error frame
        query.token = "nope".into();
        let response = router
            .oneshot(envelope_request("/cafe/v0/query", &phone, Payload::CafeQuery(query)))
            .await
            .unwrap();
        let mut buf = body_bytes(response).await;
        let frame = take_frame(&mut buf).unwrap().unwrap();
        let reply = open_bytes(&frame, &service.cafe().address).unwrap();
        assert!(matches!(reply.payload, Payload::Error(_)));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_objects_are_served_by_cid() {
        let dir = TempDir::new().unwrap();
        let (router, service) = app(&dir, ServerConfig::default()).await;
        let cid = Cid::of(b"pinned");
        service.objects().put(&cid, b"pinned").await.unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::get(format!("/cafe/v0/object/{cid}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"pinned");

        let missing = Cid::of(b"elsewhere");
        let response = router
            .oneshot(
                Request::get(format!("/cafe/v0/object/{missing}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_lists_dead_letters() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            max_delivery_attempts: 2,
            delivery_backoff: Duration::ZERO,
            ..ServerConfig::default()
        };
        let (router, service) = app(&dir, config).await;
        let phone = Identity::generate();
        register(&service, &phone).await;

        // nobody listens on the phone's topic, so every push fails
        let deliver = Message::request(
            Payload::CafeDeliverMessage(CafeDeliverMessage {
                id: "lost".into(),
                client: phone.address(),
            }),
            1,
        );
        service.handle(&Identity::generate().address(), deliver).await;
        for _ in 0..3 {
            service.relay().run_pass().await.unwrap();
        }

        let request = |path: &str, token: &str| {
            Request::get(path)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap()
        };

        let response = router
            .clone()
            .oneshot(request("/admin/dead-letters", "wrong"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = router
            .clone()
            .oneshot(request("/admin/dead-letters", ADMIN))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let letters: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(letters.as_array().unwrap().len(), 1);
        assert_eq!(letters[0]["id"], "lost");
        assert_eq!(letters[0]["attempts"], 2);

        let response = router.oneshot(request("/admin/status", ADMIN)).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(status["clients"], 1);
        assert_eq!(status["dead_letters"], 1);
    }

    #[test]
    fn test_admin_token_checks() {
        let mut config = ServerConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());

        // disabled without a configured token
        assert!(matches!(
            verify_admin_token(&headers, &config),
            Err(ServerError::Forbidden(_))
        ));

        config.admin_token = Some("secret".into());
        assert!(verify_admin_token(&headers, &config).is_ok());

        headers.insert(header::AUTHORIZATION, "Bearer secre7".parse().unwrap());
        assert!(verify_admin_token(&headers, &config).is_err());
    }

    #[test]
    fn test_open_request_requires_peer_header() {
        let headers = HeaderMap::new();
        assert!(matches!(
            open_request(&headers, &[]),
            Err(ServerError::BadRequest(_))
        ));
    }
}
