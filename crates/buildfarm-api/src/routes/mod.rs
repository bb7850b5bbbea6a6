//! API routes.

pub mod builds;
pub mod health;
pub mod jobs;
pub mod workers;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/workers", workers::router())
        .nest("/jobs", jobs::router())
        .nest("/builds", builds::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use buildfarm_core::worker::NewWorker;
    use buildfarm_db::{JobStore, MemoryJobStore};
    use buildfarm_scheduler::{Admin, Farm, ReportRouter, SchedulerSettings};
    use buildfarm_transport::{FsLibrarian, LogNotifier};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: Arc<MemoryJobStore>,
        _dir: TempDir,
    }

    fn test_app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryJobStore::new());
        let farm = Arc::new(Farm::new(
            store.clone(),
            Arc::new(FsLibrarian::new(dir.path())),
            Arc::new(LogNotifier),
            SchedulerSettings::default(),
        ));
        let state = AppState::new(Admin::new(farm), ReportRouter::new());
        TestApp {
            router: router(state),
            store,
            _dir: dir,
        }
    }

    async fn add_worker(store: &MemoryJobStore, name: &str) {
        store
            .register_worker(NewWorker {
                name: name.to_string(),
                url: format!("http://{}.example.com:8221", name),
                processor: "386".to_string(),
                virtualized: true,
                vm_host: None,
                manual: false,
                active: true,
            })
            .await
            .unwrap();
    }

    async fn call(
        app: &TestApp,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn templates_build() -> Value {
        json!({
            "spec": {
                "kind": "translation_templates",
                "branch_url": "https://code.example.com/hello/trunk",
                "series": "noble",
                "arch_tag": "i386",
                "chroot": null
            },
            "requested_by": "cprov"
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_disable_and_enable_worker() {
        let app = test_app();
        add_worker(&app.store, "bob").await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/workers/bob/disable",
            Some(json!({ "reason": "flaky disk" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], false);
        assert_eq!(body["fail_notes"], "flaky disk");

        let (_, body) = call(&app, "GET", "/api/workers", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["ok"], false);

        let (status, body) = call(&app, "POST", "/api/workers/bob/enable", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_disable_needs_reason_and_known_worker() {
        let app = test_app();
        add_worker(&app.store, "bob").await;

        let (status, _) = call(
            &app,
            "POST",
            "/api/workers/bob/disable",
            Some(json!({ "reason": " " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            "POST",
            "/api/workers/nobody/disable",
            Some(json!({ "reason": "gone" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nobody"));
    }

    #[tokio::test]
    async fn test_build_queue_rescore_cancel_retry() {
        let app = test_app();

        let (status, queued) = call(&app, "POST", "/api/builds", Some(templates_build())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(queued["score"], 2510);
        let job_id = queued["job_id"].as_i64().unwrap();
        let build_id = queued["build_id"].as_i64().unwrap();

        let (status, job) = call(
            &app,
            "POST",
            &format!("/api/jobs/{}/score", job_id),
            Some(json!({ "score": 9000 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["score"], 9000);
        assert_eq!(job["manual_score"], true);

        let cancel = format!("/api/builds/{}/cancel", build_id);
        let (status, build) = call(&app, "POST", &cancel, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(build["status"], "CANCELLED");

        let (status, _) = call(&app, "POST", &cancel, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let retry = format!("/api/builds/{}/retry", build_id);
        let (status, job) = call(&app, "POST", &retry, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "waiting");
        assert_eq!(job["score"], 2510);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let app = test_app();
        let (status, _) = call(
            &app,
            "POST",
            "/api/jobs/42/score",
            Some(json!({ "score": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_push_status_checks_report_and_scanner() {
        let app = test_app();
        add_worker(&app.store, "bob").await;

        let (status, _) = call(
            &app,
            "POST",
            "/api/workers/bob/status",
            Some(json!({ "builder_status": "BUILDING" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // No manager is running, so no scanner takes the report.
        let (status, body) = call(
            &app,
            "POST",
            "/api/workers/bob/status",
            Some(json!({ "builder_status": "IDLE" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("no scanner"));
    }
}
