use anyhow::Result;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

const HISTOGRAM_BUCKETS_MS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0,
];

pub fn describe() {
    describe_histogram!(
        "abydos_db_query_latency_ms",
        "SQLite store operation total latency in milliseconds (queue wait + execution)."
    );
    describe_counter!(
        "abydos_db_query_errors_total",
        "SQLite store operation errors."
    );
}

pub fn install_prometheus(port: u16) -> Result<()> {
    // Bind to localhost: the metrics endpoint stays private on the host and
    // scrapers reach it via localhost.
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Prefix("abydos_".to_string()), HISTOGRAM_BUCKETS_MS)
        .map_err(anyhow::Error::from)?
        .with_http_listener(addr)
        .install()
        .map_err(anyhow::Error::msg)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_recorder_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::histogram!("abydos_db_query_latency_ms", "op" => "test", "status" => "ok")
                .record(1.0);
            metrics::counter!("abydos_db_query_errors_total", "op" => "test").increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("abydos_db_query_latency_ms"));
        assert!(rendered.contains("abydos_db_query_errors_total"));
    }
}
