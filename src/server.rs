//! HTTP boundary: routes, shared state and listener lifecycle.
//!
//! `POST /` takes `{ "urls": [...] }` and answers with
//! `{ "results": [...] }`. Admission is decided before the body is read;
//! a rejected request never touches the network.

use crate::{
    check_health, install_prometheus, AdmissionController, BatchRequest, BatchResponse, Config,
    Dispatcher, Fetcher, HealthLevel, HttpFetcher, Metrics, NetworkFamily, ServerSettings,
    ServiceError,
};
use anyhow::{anyhow, Context};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Largest accepted request body. Twenty URLs fit comfortably.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// State shared by every handler.
pub struct AppState {
    pub admission: AdmissionController,
    pub dispatcher: Dispatcher,
    pub metrics: Metrics,
    pub prometheus: Option<PrometheusHandle>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            admission: AdmissionController::new(config.limits.global_limit),
            dispatcher: Dispatcher::new(fetcher, &config.limits),
            metrics: Metrics::new(),
            prometheus: None,
            config,
        }
    }

    /// Build the production state: an HTTP fetcher and, when enabled, the
    /// Prometheus recorder.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        // The recorder has to exist before metric handles are registered.
        let prometheus = if config.metrics.enabled {
            Some(install_prometheus()?)
        } else {
            None
        };

        let fetcher = HttpFetcher::new(config.limits.call_timeout)
            .context("failed to build HTTP client")?;

        let mut state = Self::new(config, Arc::new(fetcher));
        state.prometheus = prometheus;
        Ok(state)
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(send_batch))
        .route("/health", get(health))
        .route("/live", get(live))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /
///
/// The body is taken unread so that a rejected request is answered before
/// any of it is consumed.
pub async fn send_batch(
    State(state): State<Arc<AppState>>,
    body: Body,
) -> Result<Json<BatchResponse>, ServiceError> {
    let Some(slot) = state.admission.try_admit() else {
        state.metrics.record_rejection();
        debug!("Rejected batch: admission pool exhausted");
        return Err(ServiceError::AdmissionRejected);
    };
    state.metrics.record_admission(state.admission.in_flight());

    let deadline = state.config.server.request_timeout;
    // Expiry drops the batch future, which cancels every in-flight fetch.
    let result = match tokio::time::timeout(deadline, process_batch(&state, body)).await {
        Ok(result) => result,
        Err(_) => {
            state.metrics.batches_failed.increment(1);
            Err(ServiceError::DeadlineExceeded(deadline))
        }
    };

    drop(slot);
    state.metrics.set_in_flight(state.admission.in_flight());

    if let Err(err) = &result {
        error!(error = %err, "Failed to handle request");
    }
    result
}

async fn process_batch(state: &AppState, body: Body) -> Result<Json<BatchResponse>, ServiceError> {
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ServiceError::MalformedBody(e.to_string()))?;
    let request: BatchRequest =
        serde_json::from_slice(&body).map_err(|e| ServiceError::MalformedBody(e.to_string()))?;

    // Dropping the handler (client gone, request deadline) cancels every fetch.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let start = Instant::now();
    let outcome = state.dispatcher.dispatch(&cancel, request.urls).await;
    state
        .metrics
        .record_batch(start.elapsed(), outcome.as_ref().map(|_| ()));

    let batch = outcome.map_err(|err| {
        if err.is_validation() {
            debug!(kind = err.kind(), url = ?err.target(), "Batch rejected");
        } else {
            warn!(kind = err.kind(), url = ?err.target(), "Batch failed");
        }
        ServiceError::from(err)
    })?;

    Ok(Json(BatchResponse::from(batch)))
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = check_health(&state.admission);
    let status = match report.status {
        HealthLevel::Critical => StatusCode::SERVICE_UNAVAILABLE,
        HealthLevel::Healthy | HealthLevel::Warning => StatusCode::OK,
    };

    (status, Json(report))
}

/// GET /live
pub async fn live() -> StatusCode {
    StatusCode::OK
}

/// GET /metrics
///
/// Prometheus text when the exporter is installed, a JSON snapshot otherwise.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => Json(state.metrics.snapshot(&state.admission, &state.dispatcher)).into_response(),
    }
}

/// Bind the configured address, honouring the requested network family.
pub async fn bind_listener(settings: &ServerSettings) -> anyhow::Result<TcpListener> {
    let family = NetworkFamily::parse(&settings.network)?;

    let mut addrs = tokio::net::lookup_host(settings.address.as_str())
        .await
        .with_context(|| format!("failed to resolve listen address {}", settings.address))?;

    let addr = addrs.find(|addr| family.accepts(addr)).ok_or_else(|| {
        anyhow!(
            "listen address {} has no {} address",
            settings.address,
            settings.network
        )
    })?;

    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

/// Serve until a shutdown message arrives, then give in-flight requests
/// `shutdown_timeout` to finish.
///
/// The receiver should be subscribed before any setup work so that a signal
/// raised while binding is not missed.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let grace = state.config.server.shutdown_timeout;
    let addr = listener.local_addr()?;

    let stop = CancellationToken::new();
    let trigger = stop.clone();
    tokio::spawn(async move {
        // A closed channel can never deliver a signal; keep serving.
        if shutdown.recv().await.is_ok() {
            trigger.cancel();
        }
    });

    info!(%addr, "Start listening");

    let stop_accepting = stop.clone();
    let server = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            stop_accepting.cancelled().await;
            info!("Received shutdown signal");
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result.context("server error")?,
        _ = stop.cancelled() => {
            match tokio::time::timeout(grace, &mut server).await {
                Ok(result) => result.context("server error during shutdown")?,
                Err(_) => {
                    warn!(?grace, "Graceful shutdown timed out, dropping in-flight requests");
                    return Ok(());
                }
            }
        }
    }

    info!("Server gracefully stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchError, LimitsSettings};
    use async_trait::async_trait;
    use axum::http::Request;
    use bytes::Bytes;
    use tower::ServiceExt;

    /// Answers every target with the same todo, echoing nothing back.
    struct StaticFetcher;

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _: &CancellationToken, target: &str) -> Result<Bytes, FetchError> {
            if target.contains("broken") {
                return Err(FetchError::Upstream {
                    target: target.to_string(),
                    status: 500,
                });
            }
            Ok(Bytes::from_static(
                br#"{"userId":1,"id":1,"title":"t","completed":false}"#,
            ))
        }
    }

    fn test_state(global_limit: usize) -> Arc<AppState> {
        let config = Config {
            limits: LimitsSettings {
                global_limit,
                ..Default::default()
            },
            ..Default::default()
        };
        Arc::new(AppState::new(config, Arc::new(StaticFetcher)))
    }

    fn batch_request(urls: &[String]) -> Request<Body> {
        let body = serde_json::to_vec(&BatchRequest {
            urls: urls.to_vec(),
        })
        .unwrap();

        Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_successful_batch_returns_results() {
        let app = create_router(test_state(10));

        let response = app
            .oneshot(batch_request(&["https://a.test/1".to_string()]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["results"][0]["url"], "https://a.test/1");
        assert_eq!(json["results"][0]["userId"], 1);
        assert_eq!(json["results"][0]["title"], "t");
    }

    #[tokio::test]
    async fn test_exhausted_admission_returns_429() {
        let state = test_state(1);
        let _held = state.admission.try_admit().unwrap();
        let app = create_router(state.clone());

        let response = app
            .oneshot(batch_request(&["https://a.test/1".to_string()]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let json = json_body(response).await;
        assert_eq!(json["error"], crate::error::TOO_MANY_REQUESTS_MESSAGE);
        assert_eq!(state.dispatcher.stats().batches, 0);
    }

    #[tokio::test]
    async fn test_oversized_batch_returns_opaque_500() {
        let state = test_state(10);
        let app = create_router(state.clone());
        let urls: Vec<String> = (0..21).map(|i| format!("https://a.test/{i}")).collect();

        let response = app.oneshot(batch_request(&urls)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert_eq!(json["error"], crate::error::OPAQUE_FAILURE_MESSAGE);
        assert_eq!(state.dispatcher.stats().fetches_launched, 0);
    }

    #[tokio::test]
    async fn test_failed_target_returns_500_without_partial_results() {
        let app = create_router(test_state(10));
        let urls = vec![
            "https://a.test/1".to_string(),
            "https://broken.test/2".to_string(),
        ];

        let response = app.oneshot(batch_request(&urls)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert!(json.get("results").is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_returns_500_and_releases_slot() {
        let state = test_state(1);
        let app = create_router(state.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from("{\"urls\": 42"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.admission.in_flight(), 0);
        assert!(state.admission.try_admit().is_some());
    }

    #[tokio::test]
    async fn test_health_reports_critical_when_exhausted() {
        let state = test_state(1);
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let _held = state.admission.try_admit().unwrap();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "critical");
    }

    #[tokio::test]
    async fn test_metrics_snapshot_without_exporter() {
        let state = test_state(3);
        let app = create_router(state.clone());

        app.clone()
            .oneshot(batch_request(&["https://a.test/1".to_string()]))
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["admission"]["capacity"], 3);
        assert_eq!(json["admission"]["admitted_total"], 1);
        assert_eq!(json["dispatch"]["fetches_completed"], 1);
    }

    #[tokio::test]
    async fn test_bind_listener_honours_family() {
        let settings = ServerSettings {
            network: "tcp4".to_string(),
            address: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let listener = bind_listener(&settings).await.unwrap();
        assert!(listener.local_addr().unwrap().is_ipv4());

        let settings = ServerSettings {
            network: "tcp6".to_string(),
            address: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        assert!(bind_listener(&settings).await.is_err());
    }

    fn large_body_request(size: usize) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(vec![b' '; size]))
            .unwrap()
    }

    #[tokio::test]
    async fn test_exhausted_admission_rejects_before_reading_large_body() {
        let state = test_state(1);
        let _held = state.admission.try_admit().unwrap();
        let app = create_router(state.clone());

        let response = app
            .oneshot(large_body_request(3 * 1024 * 1024))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            json_body(response).await["error"],
            crate::error::TOO_MANY_REQUESTS_MESSAGE
        );
    }

    #[tokio::test]
    async fn test_body_over_limit_returns_opaque_500() {
        let state = test_state(1);
        let app = create_router(state.clone());

        let response = app
            .oneshot(large_body_request(MAX_BODY_BYTES + 1))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await["error"],
            crate::error::OPAQUE_FAILURE_MESSAGE
        );
        assert_eq!(state.admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal_sent_before_serving() {
        let settings = ServerSettings {
            address: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // Signal lands while the listener is still being set up.
        shutdown_tx.send(()).unwrap();
        let listener = bind_listener(&settings).await.unwrap();

        let stopped = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            serve(listener, test_state(1), shutdown_rx),
        )
        .await
        .expect("early shutdown signal must not be lost");
        assert!(stopped.is_ok());
    }
}
