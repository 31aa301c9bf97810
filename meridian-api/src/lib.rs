use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{Request, Response, StatusCode},
    middleware,
    routing::{get, patch},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{
    Span, debug_span,
    field::{Empty, display},
    info, instrument,
};

use meridian_state::report::{v2, v3};
use meridian_state::{Reconciler, RequestContext};
use meridian_store::{Scope, Store};
use meridian_util::cache::Cache;
use meridian_util::types::Uuid;

mod auth;
mod error;

pub use error::ApiError;

/// Shared state of the request handlers
#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn Store>,
    reconciler: Reconciler,
    api_keys: Arc<dyn Cache<str, Scope>>,
    trust_proxy: bool,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn Store>,
        reconciler: Reconciler,
        api_keys: Arc<dyn Cache<str, Scope>>,
    ) -> Self {
        Self {
            store,
            reconciler,
            api_keys,
            trust_proxy: false,
        }
    }

    /// Take the client address from the `X-Forwarded-For` header when
    /// present
    pub fn with_trusted_proxy(self, trust_proxy: bool) -> Self {
        Self {
            trust_proxy,
            ..self
        }
    }
}

/// Build the API routes
pub fn router(state: ApiState) -> Router {
    let device_routes = Router::new()
        .route("/device/v3/state", patch(patch_v3_state))
        .route("/device/v2/{uuid}/state", patch(patch_v2_state))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authorize,
        ));

    Router::new()
        .route("/ping", get(|| async { "OK" }))
        .merge(device_routes)
        .with_state(state)
}

/// Start the API
///
/// Receives a TCP listener already bound to the right address and port.
#[instrument(name = "api", skip_all)]
pub async fn start(listener: TcpListener, state: ApiState) -> io::Result<()> {
    let api_span = Span::current();

    // Enable tracing
    let app = router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(move |request: &Request<Body>| {
                debug_span!(parent: &api_span, "request",
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                    status = Empty,
                )
            })
            .on_response(|response: &Response<Body>, _: Duration, span: &Span| {
                span.record("status", display(response.status()));
            }),
    );

    info!(address = ?listener.local_addr().ok(), "ready");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// Handle `PATCH /device/v3/state`
///
/// Applies the state report of one or more devices
#[instrument(skip_all)]
async fn patch_v3_state(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let report = v3::parse(&body)?;
    state.reconciler.reconcile(report, &ctx).await?;
    Ok(StatusCode::OK)
}

/// Handle `PATCH /device/v2/{uuid}/state`
#[instrument(skip_all, fields(device = %uuid))]
async fn patch_v2_state(
    State(state): State<ApiState>,
    Path(uuid): Path<Uuid>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let report = v2::parse(uuid, &body)?;
    state.reconciler.reconcile(report, &ctx).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    use meridian_state::MetricsThrottle;
    use meridian_store::{DeviceField, FieldValue, MemoryStore, Seed};
    use meridian_util::cache::{MemoryTier, TieredCache};

    fn seed() -> Seed {
        serde_json::from_value(json!({
            "applications": [
                {"id": 1, "uuid": "a1"},
                {"id": 2, "uuid": "a2"}
            ],
            "devices": [
                {"id": 10, "uuid": "d1", "belongs_to__application": 1},
                {"id": 20, "uuid": "d2", "belongs_to__application": 2}
            ],
            "releases": [
                {"id": 5, "commit": "r1", "belongs_to__application": 1}
            ],
            "images": [
                {"id": 9, "is_stored_at__image_location": "img-loc-1"}
            ],
            "api_keys": [
                {"key": "admin-key", "scope": {"kind": "admin"}},
                {"key": "d1-key", "scope": {"kind": "device", "uuid": "d1"}}
            ]
        }))
        .unwrap()
    }

    fn cache<V>(name: &str) -> TieredCache<V> {
        TieredCache::new(
            name,
            "test",
            Duration::from_secs(60),
            Arc::new(MemoryTier::default()),
        )
    }

    async fn setup_test_server(trust_proxy: bool) -> (u16, MemoryStore) {
        let store = MemoryStore::with_seed(seed()).unwrap();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let reconciler = Reconciler::new(
            Arc::clone(&shared),
            MetricsThrottle::new(Arc::new(cache::<Uuid>("device-metrics"))),
        );
        let state = ApiState::new(shared, reconciler, Arc::new(cache::<Scope>("api-keys")))
            .with_trusted_proxy(trust_proxy);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(start(listener, state));

        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        (port, store)
    }

    async fn patch_state(
        port: u16,
        path: &str,
        key: Option<&str>,
        body: Value,
    ) -> reqwest::Response {
        let client = reqwest::Client::new();
        let request = client
            .patch(format!("http://127.0.0.1:{port}{path}"))
            .json(&body);
        let request = match key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };
        request.send().await.unwrap()
    }

    fn d1_report() -> Value {
        json!({
            "d1": {
                "status": "Idle",
                "apps": {
                    "a1": {
                        "release_uuid": "r1",
                        "releases": {
                            "r1": {
                                "services": {
                                    "main": { "image": "img-loc-1", "status": "Running" }
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_ping() {
        let (port, _) = setup_test_server(false).await;
        let response = reqwest::get(format!("http://127.0.0.1:{port}/ping"))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn test_v3_state_requires_credentials() {
        let (port, store) = setup_test_server(false).await;
        let before = store.snapshot();

        let response = patch_state(port, "/device/v3/state", None, d1_report()).await;
        assert_eq!(response.status(), 401);

        let response = patch_state(port, "/device/v3/state", Some("nope"), d1_report()).await;
        assert_eq!(response.status(), 401);
        assert_eq!(response.text().await.unwrap(), "");

        assert_eq!(*store.snapshot(), *before);
    }

    #[tokio::test]
    async fn test_v3_state_applies_the_report() {
        let (port, store) = setup_test_server(false).await;

        let response = patch_state(port, "/device/v3/state", Some("d1-key"), d1_report()).await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "");

        let snapshot = store.snapshot();
        let fields = &snapshot.devices[&10].fields;
        assert_eq!(
            fields.get(&DeviceField::Status),
            Some(&FieldValue::Text("Idle".into()))
        );
        assert_eq!(
            fields.get(&DeviceField::IsRunningRelease),
            Some(&FieldValue::Integer(5))
        );
        assert_eq!(
            fields.get(&DeviceField::PublicAddress),
            Some(&FieldValue::Text("127.0.0.1".into()))
        );
        assert_eq!(snapshot.image_installs.len(), 1);
    }

    #[tokio::test]
    async fn test_v3_state_rejects_devices_out_of_scope() {
        let (port, store) = setup_test_server(false).await;
        let before = store.snapshot();

        let response = patch_state(
            port,
            "/device/v3/state",
            Some("d1-key"),
            json!({
                "d1": {"status": "Idle"},
                "d2": {"status": "Idle"}
            }),
        )
        .await;

        assert_eq!(response.status(), 401);
        assert_eq!(response.text().await.unwrap(), "");
        assert_eq!(*store.snapshot(), *before);
    }

    #[tokio::test]
    async fn test_v3_state_rejects_empty_reports() {
        let (port, _) = setup_test_server(false).await;

        let response =
            patch_state(port, "/device/v3/state", Some("admin-key"), json!({"d1": null})).await;
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_v2_state_applies_the_report() {
        let (port, store) = setup_test_server(true).await;
        let client = reqwest::Client::new();

        let response = client
            .patch(format!("http://127.0.0.1:{port}/device/v2/d1/state"))
            .bearer_auth("d1-key")
            .header("x-forwarded-for", "203.0.113.9")
            .json(&json!({
                "local": {
                    "is_on__commit": "r1",
                    "apps": {
                        "1": {
                            "services": {
                                "9": { "releaseId": 5, "status": "Running" }
                            }
                        }
                    }
                }
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let snapshot = store.snapshot();
        let fields = &snapshot.devices[&10].fields;
        assert_eq!(
            fields.get(&DeviceField::IsRunningRelease),
            Some(&FieldValue::Integer(5))
        );
        assert_eq!(
            fields.get(&DeviceField::PublicAddress),
            Some(&FieldValue::Text("203.0.113.9".into()))
        );
    }

    #[tokio::test]
    async fn test_v2_state_rejects_unknown_images() {
        let (port, store) = setup_test_server(false).await;
        let before = store.snapshot();

        let response = patch_state(
            port,
            "/device/v2/d1/state",
            Some("admin-key"),
            json!({
                "local": {
                    "status": "Idle",
                    "apps": {
                        "1": {
                            "services": {
                                "99": { "releaseId": 5, "status": "Running" }
                            }
                        }
                    }
                }
            }),
        )
        .await;

        assert_eq!(response.status(), 401);
        assert_eq!(*store.snapshot(), *before);
    }
}
