mod common;

use common::*;

#[tokio::test]
async fn metrics_expose_route_counters_and_histogram() {
    let detector = spawn_detector(Vec::new()).await;
    let vault = spawn_vault().await;
    let provider = spawn_provider(ProviderProbe::default()).await;
    let gateway = spawn_gateway(gateway_config(&detector, &vault, &provider)).await;

    for _ in 0..3 {
        let response = reqwest::get(format!("{}/health", gateway)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    let response = reqwest::get(format!("{}/metrics", gateway)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
    let text = response.text().await.unwrap();

    assert!(text.contains("saferoute_requests_total{method=\"GET\",path=\"/health\"} 3"));
    assert!(text.contains("saferoute_request_latency_ms_bucket{le=\"+Inf\"}"));
    assert!(text.contains(&format!(
        "saferoute_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )));
    assert!(text.contains("saferoute_process_start_time_seconds"));
    assert!(text.contains("saferoute_process_uptime_seconds"));
    // One client: the test itself.
    assert!(text.contains("saferoute_admission_tracked_clients 1"));
}
