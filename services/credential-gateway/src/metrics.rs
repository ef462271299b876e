//! Prometheus metrics exposition
//!
//! The pool and rotator emit their own series through the `metrics` facade:
//!
//! - `session_pool_acquire_total` (counter): label `outcome`
//! - `session_pool_sessions` (gauge): label `state`
//! - `credential_rotations_total` (counter): labels `policy`, `outcome`
//!
//! This module adds the gateway's request series:
//!
//! - `gateway_requests_total` (counter): labels `route`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed API request.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("gateway_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "route" => route).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_request_does_not_panic_without_recorder() {
        record_request("/password", 200, 0.01);
    }

    /// Isolated recorder; install_recorder() would panic on a second call.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_renders_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/password", 200, 0.042);
        record_request("/connect", 401, 0.2);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("route=\"/password\""));
        assert!(output.contains("status=\"401\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "duration must render as a histogram"
        );
        assert!(output.contains("le=\"30\""));
    }

    #[tokio::test]
    async fn pool_and_rotation_series_are_exported() {
        use endpoint::MemoryEndpoint;
        use session::{Identity, PasswordChange};
        use session_pool::{PoolConfig, SessionPool};
        use std::sync::Arc;

        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let endpoint = Arc::new(MemoryEndpoint::new());
        endpoint.create_account("scott", "tiger").await;
        let identity = Identity::new("scott", "tiger");
        let pool = SessionPool::create(endpoint, identity, "", PoolConfig::default())
            .await
            .unwrap();
        let mut session = pool.acquire().await.unwrap();
        session
            .change_password(&PasswordChange::new("scott", "wrong", "lion"))
            .await
            .unwrap_err();

        let output = handle.render();
        assert!(output.contains("session_pool_acquire_total{outcome=\"ok\"} 1"));
        assert!(output.contains("session_pool_sessions{state=\"busy\"} 1"));
        assert!(output.contains("credential_rotations_total"));
        assert!(output.contains("policy=\"self_service\""));
        assert!(output.contains("outcome=\"invalid-old-credential\""));
    }
}
