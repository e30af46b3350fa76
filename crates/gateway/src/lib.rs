//! HTTP gateway for identra.
//!
//! Exposes the identity resolver over REST:
//! - `POST /identify` resolves an email and/or phone number to its
//!   consolidated contact
//! - `GET /health` is a liveness probe
//!
//! Every other route answers 404. Internal failures are reported to the
//! caller as an opaque 500; the cause only reaches the logs.
//!
//! Built on Axum.

use axum::extract::DefaultBodyLimit;
use axum::extract::rejection::JsonRejection;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use identra_config::{AppConfig, GatewayConfig};
use identra_core::{Error, IdentityView};
use identra_resolver::ClusterResolver;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub resolver: ClusterResolver,
}

pub type SharedState = Arc<GatewayState>;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

const INTERNAL_ERROR: &str = "Internal server error.";

/// Build the Axum router with all gateway routes.
///
/// Layers applied:
/// - Request body size limit (`gateway.body_limit_bytes`)
/// - CORS, only when `gateway.allowed_origins` is non-empty
/// - HTTP trace logging
pub fn build_router(state: SharedState, config: &GatewayConfig) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler).fallback(not_found))
        .route("/identify", post(identify_handler).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.body_limit_bytes));

    let router = match cors_layer(&config.allowed_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    };

    router.layer(tower_http::trace::TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let allowed: Vec<axum::http::HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    if allowed.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE])
            .max_age(std::time::Duration::from_secs(3600)),
    )
}

/// Start the gateway HTTP server.
///
/// Opens the configured store, serves until Ctrl-C or SIGTERM, drains
/// in-flight requests, then closes the store.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let store = identra_store::connect(&config.database).await?;
    let resolver = ClusterResolver::new(store.clone(), &config.resolver);
    let state = Arc::new(GatewayState { resolver });
    let app = build_router(state, &config.gateway);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, backend = store.name(), "Identity gateway listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    store.close().await;
    served?;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

async fn not_found() -> (StatusCode, Json<ErrorResponse>) {
    error_body(StatusCode::NOT_FOUND, "Route not found.")
}

#[derive(Serialize)]
struct IdentifyResponse {
    contact: IdentityView,
}

async fn identify_handler(
    State(state): State<SharedState>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<IdentifyResponse> {
    let Json(body) = body.map_err(|rejection| {
        let status = match rejection.status() {
            StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        error_body(status, rejection.body_text())
    })?;

    let Value::Object(fields) = body else {
        return Err(error_body(
            StatusCode::BAD_REQUEST,
            "request body must be a JSON object",
        ));
    };
    let email = string_field(&fields, "email")?;
    let phone_number = string_field(&fields, "phoneNumber")?;

    let contact = state
        .resolver
        .identify(email, phone_number)
        .await
        .map_err(into_response_error)?;

    Ok(Json(IdentifyResponse { contact }))
}

/// A field that must be a string when present. `null` counts as absent.
fn string_field(
    fields: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<Option<String>, (StatusCode, Json<ErrorResponse>)> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(error_body(
            StatusCode::BAD_REQUEST,
            format!("{name} must be a string"),
        )),
    }
}

/// Map a resolver error to its HTTP shape. Only validation messages are
/// shown to the caller.
fn into_response_error(err: Error) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        Error::InvalidRequest(message) => error_body(StatusCode::BAD_REQUEST, message),
        Error::InvariantViolation(detail) => {
            error!(kind = "invariant_violation", detail = %detail, "Contact cluster is corrupt");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
        }
        other => {
            error!(kind = other.kind(), error = %other, "Identify request failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use identra_core::{ContactStore, NewContact};
    use identra_store::InMemoryStore;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let resolver = ClusterResolver::new(store.clone(), &Default::default());
        let app = build_router(Arc::new(GatewayState { resolver }), &GatewayConfig::default());
        (app, store)
    }

    fn post_identify(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/identify")
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (app, _) = test_app();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let (status, json) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn identify_creates_primary() {
        let (app, store) = test_app();
        let body = serde_json::json!({ "email": "mcfly@hillvalley.edu", "phoneNumber": "123456" });

        let (status, json) = send(app, post_identify(body.to_string())).await;
        assert_eq!(status, StatusCode::OK);

        let contact = &json["contact"];
        assert!(contact["primaryContactId"].is_i64());
        assert_eq!(contact["emails"], serde_json::json!(["mcfly@hillvalley.edu"]));
        assert_eq!(contact["phoneNumbers"], serde_json::json!(["123456"]));
        assert_eq!(contact["secondaryContactIds"], serde_json::json!([]));
        assert_eq!(store.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn identify_merges_across_requests() {
        let (app, _) = test_app();

        let (_, first) = send(
            app.clone(),
            post_identify(r#"{"email":"george@hillvalley.edu","phoneNumber":"919191"}"#),
        )
        .await;
        let (_, second) = send(
            app.clone(),
            post_identify(r#"{"email":"biffsucks@hillvalley.edu","phoneNumber":"717171"}"#),
        )
        .await;
        let (status, merged) = send(
            app,
            post_identify(r#"{"email":"george@hillvalley.edu","phoneNumber":"717171"}"#),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let contact = &merged["contact"];
        assert_eq!(contact["primaryContactId"], first["contact"]["primaryContactId"]);
        assert_eq!(
            contact["emails"],
            serde_json::json!(["george@hillvalley.edu", "biffsucks@hillvalley.edu"])
        );
        assert_eq!(contact["phoneNumbers"], serde_json::json!(["919191", "717171"]));
        let demoted = second["contact"]["primaryContactId"].clone();
        assert_eq!(contact["secondaryContactIds"], Value::Array(vec![demoted]));
    }

    #[tokio::test]
    async fn identify_requires_a_fragment() {
        let (app, store) = test_app();

        let (status, json) = send(app.clone(), post_identify("{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("required"));

        let (status, _) = send(app, post_identify(r#"{"email":null,"phoneNumber":""}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn identify_rejects_non_string_fields() {
        let (app, store) = test_app();

        let (status, json) = send(app.clone(), post_identify(r#"{"phoneNumber":123456}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "phoneNumber must be a string");

        let (status, _) = send(app, post_identify(r#"{"email":["a@x.com"]}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn identify_rejects_malformed_json() {
        let (app, _) = test_app();

        let (status, json) = send(app.clone(), post_identify("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());

        let (status, _) = send(app, post_identify(r#"["a@x.com"]"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = ClusterResolver::new(store, &Default::default());
        let config = GatewayConfig {
            body_limit_bytes: 32,
            ..GatewayConfig::default()
        };
        let app = build_router(Arc::new(GatewayState { resolver }), &config);

        let body = format!(r#"{{"email":"{}@x.com"}}"#, "a".repeat(64));
        let response = app.oneshot(post_identify(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn corrupt_cluster_is_an_opaque_500() {
        let (app, store) = test_app();
        let mut tx = store.begin(&[]).await.unwrap();
        let p = tx
            .create(NewContact::primary(Some("a@x.com".into()), None))
            .await
            .unwrap();
        tx.create(NewContact::secondary(Some("b@x.com".into()), None, p.id))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        store.soft_delete(p.id).await;

        let (status, json) = send(app, post_identify(r#"{"email":"b@x.com"}"#)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "Internal server error.");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (app, _) = test_app();
        let req = Request::builder()
            .uri("/contacts")
            .body(Body::empty())
            .unwrap();

        let (status, json) = send(app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "Route not found.");
    }

    #[tokio::test]
    async fn wrong_method_is_404() {
        let (app, _) = test_app();
        let req = Request::builder()
            .uri("/identify")
            .body(Body::empty())
            .unwrap();

        let (status, json) = send(app, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "Route not found.");
    }

    #[test]
    fn cors_layer_skips_when_unconfigured() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["http://localhost:5173".into()]).is_some());
    }
}
