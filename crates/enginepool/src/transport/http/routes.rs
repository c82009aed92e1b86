//! HTTP route handlers.
//!
//! `/start` and `/end` are kept as aliases of `/acquire` and `/release` for
//! clients written against the old process server.

use std::sync::Arc;

use axum::{
    Form, Router,
    extract::{State, rejection::FormRejection},
    http::{
        HeaderName, Method,
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN},
    },
    response::Json,
    routing::post,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::{AcquireError, Lease, PoolService};
use crate::supervisor::ProcessId;

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub port: u16,
    #[serde(rename = "workerId", alias = "pid")]
    pub worker_id: ProcessId,
}

async fn acquire(State(service): State<Arc<PoolService>>) -> Json<Lease> {
    // Own task: a client hanging up must not cancel a half-started worker.
    let task = tokio::spawn(async move { service.acquire().await });

    let lease = match task.await {
        Ok(Ok(lease)) => lease,
        Ok(Err(AcquireError::CapacityExhausted)) => Lease::NONE,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Acquire failed");
            Lease::NONE
        }
        Err(e) => {
            tracing::error!(error = %e, "Acquire task did not complete");
            Lease::NONE
        }
    };

    Json(lease)
}

/// Always acknowledges, whether or not anything was released.
async fn release(
    State(service): State<Arc<PoolService>>,
    form: Result<Form<ReleaseRequest>, FormRejection>,
) -> &'static str {
    match form {
        Ok(Form(request)) => {
            service.release(request.port, request.worker_id);
        }
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Ignoring malformed release");
        }
    }
    "success"
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            ORIGIN,
            HeaderName::from_static("x-requested-with"),
            CONTENT_TYPE,
            AUTHORIZATION,
            ACCEPT,
        ])
}

pub fn routes(service: Arc<PoolService>) -> Router {
    Router::new()
        .route("/acquire", post(acquire))
        .route("/release", post(release))
        .route("/start", post(acquire))
        .route("/end", post(release))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::config::PoolConfig;
    use crate::slot::SlotState;
    use crate::testing::{ChildMode, MockSupervisor};

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn response_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn create_service(capacity: usize, mock: &Arc<MockSupervisor>) -> Arc<PoolService> {
        let config = PoolConfig::new("/opt/engine/worker")
            .with_capacity(capacity)
            .with_start_port(8888)
            .with_resolve_timeout(Duration::from_millis(500));
        Arc::new(PoolService::new(&config, mock.clone()).unwrap())
    }

    async fn post_empty(service: &Arc<PoolService>, path: &str) -> axum::response::Response {
        routes(Arc::clone(service))
            .oneshot(Request::post(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post_form(
        service: &Arc<PoolService>,
        path: &str,
        body: &str,
    ) -> axum::response::Response {
        routes(Arc::clone(service))
            .oneshot(
                Request::post(path)
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn acquire_returns_port_and_worker() {
        let mock = Arc::new(MockSupervisor::new());
        let service = create_service(2, &mock);

        let response = post_empty(&service, "/acquire").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        insta::assert_json_snapshot!(json, @r#"
        {
          "port": 8888,
          "workerId": 1001
        }
        "#);
    }

    #[tokio::test]
    async fn start_is_an_alias_for_acquire() {
        let mock = Arc::new(MockSupervisor::new());
        let service = create_service(2, &mock);

        post_empty(&service, "/acquire").await;
        let json = response_json(post_empty(&service, "/start").await).await;
        assert_eq!(json["port"], 8889);
    }

    #[tokio::test]
    async fn exhausted_pool_returns_zero_sentinel() {
        let mock = Arc::new(MockSupervisor::new());
        let service = create_service(1, &mock);

        post_empty(&service, "/acquire").await;
        let response = post_empty(&service, "/acquire").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json, serde_json::json!({"port": 0, "workerId": 0}));
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_failure_returns_zero_sentinel() {
        let mock = Arc::new(MockSupervisor::new());
        mock.set_mode(ChildMode::Missing);
        let service = create_service(1, &mock);

        let json = response_json(post_empty(&service, "/acquire").await).await;
        assert_eq!(json, serde_json::json!({"port": 0, "workerId": 0}));
        assert_eq!(service.table().get(8888), Some(SlotState::Free));
    }

    #[tokio::test]
    async fn release_clears_matching_slot() {
        let mock = Arc::new(MockSupervisor::new());
        let service = create_service(1, &mock);
        let lease = response_json(post_empty(&service, "/acquire").await).await;

        let body = format!("port={}&workerId={}", lease["port"], lease["workerId"]);
        let response = post_form(&service, "/release", &body).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, "success");
        assert_eq!(service.table().get(8888), Some(SlotState::Free));
    }

    #[tokio::test]
    async fn end_accepts_legacy_pid_field() {
        let mock = Arc::new(MockSupervisor::new());
        let service = create_service(1, &mock);
        let lease = response_json(post_empty(&service, "/start").await).await;

        let body = format!("port={}&pid={}", lease["port"], lease["workerId"]);
        let response = post_form(&service, "/end", &body).await;

        assert_eq!(response_text(response).await, "success");
        assert_eq!(service.table().get(8888), Some(SlotState::Free));
    }

    #[tokio::test]
    async fn stale_release_still_acknowledges() {
        let mock = Arc::new(MockSupervisor::new());
        let service = create_service(1, &mock);
        post_empty(&service, "/acquire").await;

        let response = post_form(&service, "/release", "port=8888&workerId=31337").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_text(response).await, "success");
        assert!(service.table().get(8888).unwrap().occupant().is_some());
    }

    #[tokio::test]
    async fn malformed_release_still_acknowledges() {
        let mock = Arc::new(MockSupervisor::new());
        let service = create_service(1, &mock);
        post_empty(&service, "/acquire").await;

        for body in ["", "port=abc&workerId=1", "garbage"] {
            let response = post_form(&service, "/release", body).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response_text(response).await, "success");
        }
        let response = post_empty(&service, "/release").await;
        assert_eq!(response.status(), StatusCode::OK);

        assert!(service.table().get(8888).unwrap().occupant().is_some());
    }

    #[tokio::test]
    async fn cors_preflight_allows_any_origin() {
        let mock = Arc::new(MockSupervisor::new());
        let service = create_service(1, &mock);

        let response = routes(service)
            .oneshot(
                Request::options("/acquire")
                    .header("origin", "http://viewer.example")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert!(mock.spawned().is_empty());
    }

    #[tokio::test]
    async fn get_is_not_routed() {
        let mock = Arc::new(MockSupervisor::new());
        let service = create_service(1, &mock);

        let response = routes(service)
            .oneshot(Request::get("/acquire").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
