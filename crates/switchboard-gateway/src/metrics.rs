//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record a call session starting.
pub fn record_call_start() {
    metrics::gauge!("calls_active").increment(1.0);
}

/// Record a call session ending.
pub fn record_call_end() {
    metrics::gauge!("calls_active").decrement(1.0);
}

/// Record one inbound frame forwarded to transcription.
pub fn record_media_frame() {
    metrics::counter!("media_frames_total").increment(1);
}

/// Record the outcome of one reply turn (`played`, `generation`, `synthesis`, ...).
pub fn record_reply(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("replies_total", &labels).increment(1);
}

/// Record a session that ended by fault.
pub fn record_session_fault(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("session_faults_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder per process; a second install reports an error.
        if let Ok(handle) = install_prometheus_recorder() {
            record_call_start();
            record_reply("played");
            let output = handle.render();
            assert!(output.contains("calls_active"));
            assert!(output.contains("replies_total"));
        }
    }

    #[test]
    fn test_record_without_recorder_does_not_panic() {
        // The metrics crate falls back to a no-op recorder.
        record_media_frame();
        record_session_fault("connection");
        record_call_end();
    }
}
