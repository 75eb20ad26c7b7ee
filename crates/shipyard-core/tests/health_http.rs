//! HTTP health verification against a mock service.

use std::sync::Arc;
use std::time::Duration;

use shipyard_core::{Backoff, HealthVerifier, HttpHealthProbe};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FAST: Backoff = Backoff::Linear {
    step: Duration::from_millis(20),
};

fn verifier() -> HealthVerifier {
    HealthVerifier::new(Arc::new(HttpHealthProbe::new(Duration::from_secs(2))))
}

#[tokio::test]
async fn healthy_service_passes_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    assert!(verifier().verify(&server.uri(), 3, FAST).await);
}

#[tokio::test]
async fn unhealthy_service_exhausts_exact_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    assert!(!verifier().verify(&server.uri(), 3, FAST).await);
}

#[tokio::test]
async fn recovers_once_service_comes_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let backoff = Backoff::Exponential {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(40),
    };
    assert!(verifier().verify(&server.uri(), 5, backoff).await);
}

#[tokio::test]
async fn only_the_liveness_path_is_probed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    assert!(!verifier().verify(&server.uri(), 1, FAST).await);
}
