//! HTTP trigger surface for the probe.
//!
//! Mounts `enable`, `disable`, `end`, and a read-only `dashboard_api` under
//! a caller-chosen prefix. Errors never propagate to the host server: they
//! are logged and answered as `application/problem+json`.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::{error, info};

use crate::probe::{Probe, ProbeState};

/// Build a router exposing the probe trigger endpoints under `/<prefix>/`.
pub fn router(probe: Probe, prefix: &str) -> Router {
    let prefix = prefix.trim_matches('/');
    Router::new()
        .route(&format!("/{prefix}/enable"), get(enable_handler))
        .route(&format!("/{prefix}/disable"), get(disable_handler))
        .route(&format!("/{prefix}/end"), get(end_handler))
        .route(&format!("/{prefix}/dashboard_api"), get(dashboard_api_handler))
        .with_state(probe)
}

/// RFC 7807 style error document.
#[derive(Debug, Serialize)]
struct Problem {
    title: String,
    status: u16,
    detail: String,
}

#[derive(Serialize)]
struct StatusDocument {
    profiling: ProfilingStatus,
    profiles: ProfilesDocument,
}

#[derive(Serialize)]
struct ProfilingStatus {
    enabled: bool,
    sample_rate: u32,
}

#[derive(Serialize)]
struct ProfilesDocument {
    #[serde(rename = "_embedded")]
    embedded: Vec<ProfileSummary>,
}

#[derive(Serialize)]
struct ProfileSummary {
    #[serde(rename = "UUID")]
    uuid: String,
    url: String,
    name: String,
    status: String,
    created_at: String,
}

async fn enable_handler(
    State(probe): State<Probe>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(title) = params.get("title") {
        probe.set_current_title(title.clone());
    }

    let seconds = match params.get("duration") {
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v >= 0.0 => v,
            Ok(v) => {
                return problem(StatusCode::BAD_REQUEST, "Wrong duration", format!("negative duration: {v}"));
            }
            Err(e) => {
                return problem(StatusCode::BAD_REQUEST, "Wrong duration", e.to_string());
            }
        },
        None => 0.0,
    };

    if seconds > 0.0 {
        info!(seconds, "profiling via HTTP trigger");
    } else {
        info!("enable profiling via HTTP trigger");
    }

    match probe.enable_now_for(Duration::from_secs_f64(seconds)).await {
        Ok(()) => status_response(&probe).await,
        Err(e) => problem(StatusCode::INTERNAL_SERVER_ERROR, "Enable error", e.to_string()),
    }
}

async fn disable_handler(State(probe): State<Probe>) -> Response {
    info!("disable profiling via HTTP trigger");
    match probe.disable().await {
        Ok(()) => status_response(&probe).await,
        Err(e) => problem(StatusCode::INTERNAL_SERVER_ERROR, "Disable error", e.to_string()),
    }
}

async fn end_handler(State(probe): State<Probe>) -> Response {
    info!("end profiling via HTTP trigger");
    match probe.end().await {
        Ok(()) => status_response(&probe).await,
        Err(e) => problem(StatusCode::INTERNAL_SERVER_ERROR, "End error", e.to_string()),
    }
}

async fn dashboard_api_handler(State(probe): State<Probe>) -> Response {
    status_response(&probe).await
}

async fn status_response(probe: &Probe) -> Response {
    let embedded = probe
        .last_profiles()
        .await
        .into_iter()
        .map(|handle| ProfileSummary {
            uuid: handle.uuid,
            url: handle.view_url,
            name: handle.title,
            status: handle.status.name,
            created_at: handle.created_at,
        })
        .collect();

    let document = StatusDocument {
        profiling: ProfilingStatus {
            enabled: probe.current_state() == ProbeState::Enabled,
            sample_rate: probe.config().cpu_sample_rate_hz,
        },
        profiles: ProfilesDocument { embedded },
    };

    axum::Json(document).into_response()
}

fn problem(status: StatusCode, title: &str, detail: String) -> Response {
    error!(title, detail = detail.as_str(), "HTTP trigger error");
    let body = Problem {
        title: title.to_string(),
        status: status.as_u16(),
        detail,
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/problem+json")],
        serde_json::to_string(&body).unwrap_or_default(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::sampler::NullSampler;

    fn test_probe() -> Probe {
        let config = Configuration {
            agent_socket: "tcp://127.0.0.1:0".to_string(),
            blackfire_query: Some("expires=9999&signature=sig".to_string()),
            ..Default::default()
        };
        Probe::new(config, Box::new(NullSampler::default())).expect("probe")
    }

    async fn serve(probe: Probe) -> String {
        let app = router(probe, "profiler");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_enable_then_dashboard_api() {
        let probe = test_probe();
        let base = serve(probe.clone()).await;

        let response = reqwest::get(format!("{base}/profiler/enable?duration=60&title=checkout"))
            .await
            .expect("enable");
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["profiling"]["enabled"], true);
        assert_eq!(body["profiling"]["sample_rate"], 100);
        assert_eq!(probe.current_state(), ProbeState::Enabled);

        let response = reqwest::get(format!("{base}/profiler/dashboard_api"))
            .await
            .expect("dashboard");
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["profiling"]["enabled"], true);
        assert!(body["profiles"]["_embedded"].is_array());
    }

    #[tokio::test]
    async fn test_bad_duration_is_a_problem_document() {
        let base = serve(test_probe()).await;

        let response = reqwest::get(format!("{base}/profiler/enable?duration=abc"))
            .await
            .expect("request");
        assert_eq!(response.status(), 400);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/problem+json")
        );
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["title"], "Wrong duration");
        assert_eq!(body["status"], 400);
    }

    #[tokio::test]
    async fn test_disable_in_wrong_state_is_500() {
        let base = serve(test_probe()).await;

        let response = reqwest::get(format!("{base}/profiler/disable"))
            .await
            .expect("request");
        assert_eq!(response.status(), 500);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["title"], "Disable error");
    }

    #[tokio::test]
    async fn test_end_with_no_samples_succeeds() {
        let probe = test_probe();
        let base = serve(probe.clone()).await;

        reqwest::get(format!("{base}/profiler/enable"))
            .await
            .expect("enable");
        let response = reqwest::get(format!("{base}/profiler/end"))
            .await
            .expect("end");
        assert_eq!(response.status(), 200);
        assert_eq!(probe.current_state(), ProbeState::Off);
    }
}
