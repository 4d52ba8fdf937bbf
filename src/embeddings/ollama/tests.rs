use super::*;
use crate::config::OllamaConfig;

#[test]
fn client_configuration() {
    let config = OllamaConfig {
        protocol: "http".to_string(),
        host: "test-host".to_string(),
        port: 1234,
        model: "test-model".to_string(),
        batch_size: 128,
        ..OllamaConfig::default()
    };
    let client = OllamaClient::new(&config).expect("Failed to create client");

    assert_eq!(client.model, "test-model");
    assert_eq!(client.batch_size, 128);
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
    assert_eq!(client.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
}

#[test]
fn client_builder_methods() {
    let client = OllamaClient::new(&OllamaConfig::default())
        .expect("Failed to create client")
        .with_timeout(Duration::from_secs(60))
        .with_retry_attempts(5)
        .with_backoff_unit(Duration::from_millis(5));

    assert_eq!(client.retry_attempts, 5);
    assert_eq!(client.backoff_unit, Duration::from_millis(5));

    let clamped = client.with_retry_attempts(0);
    assert_eq!(clamped.retry_attempts, 1);
}

#[test]
fn model_dimension_comes_from_config() {
    let config = OllamaConfig {
        embedding_dimension: 384,
        ..OllamaConfig::default()
    };
    let model = OllamaModel::from_config(&config).expect("Failed to create model");
    assert_eq!(model.dimension(), 384);
    assert_eq!(model.name(), config.model);
}

mod mock_server {
    use wiremock::{
        Mock, MockServer, Request, Respond, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    /// Answers `/api/embed` with `[1.0, len]` for each input
    struct EchoEmbeddings;

    impl Respond for EchoEmbeddings {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: serde_json::Value =
                serde_json::from_slice(&request.body).expect("request body should be JSON");
            let inputs = body["input"].as_array().cloned().unwrap_or_default();
            let embeddings: Vec<Vec<f32>> = inputs
                .iter()
                .map(|input| {
                    let text = input.as_str().unwrap_or_default();
                    vec![1.0, text.len() as f32]
                })
                .collect();
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test-model",
                "embeddings": embeddings,
            }))
        }
    }

    fn client_for(server: &MockServer, batch_size: u32) -> OllamaClient {
        let config = OllamaConfig {
            model: "test-model".to_string(),
            batch_size,
            ..OllamaConfig::default()
        };
        OllamaClient::new(&config)
            .expect("Failed to create client")
            .with_base_url(Url::parse(&server.uri()).expect("mock uri should parse"))
            .with_backoff_unit(Duration::from_millis(1))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn embeds_single_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(EchoEmbeddings)
            .expect(1)
            .mount(&server)
            .await;

        let model = OllamaModel::new(client_for(&server, 16), 2);
        let vector = model.embed("hello").await.expect("embedding should succeed");
        assert_eq!(vector, vec![1.0, 5.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batches_follow_configured_size_and_keep_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(EchoEmbeddings)
            .expect(3)
            .mount(&server)
            .await;

        let texts: Vec<String> = ["a", "bb", "ccc", "dddd", "eeeee"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let model = OllamaModel::new(client_for(&server, 2), 2);
        let vectors = model
            .embed_batch(&texts)
            .await
            .expect("batch embedding should succeed");

        let lengths: Vec<f32> = vectors.iter().map(|v| v[1]).collect();
        assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let model = OllamaModel::new(client_for(&server, 16), 2);
        let err = model.embed("hello").await.expect_err("should fail after retries");
        assert!(matches!(err, crate::FeedbackError::Embedding(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let model = OllamaModel::new(client_for(&server, 16), 2);
        let err = model.embed("hello").await.expect_err("404 should fail");
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatched_response_count_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [],
            })))
            .mount(&server)
            .await;

        let model = OllamaModel::new(client_for(&server, 16), 2);
        let err = model.embed("hello").await.expect_err("empty response should fail");
        assert!(err.to_string().contains("Mismatch"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_check_validates_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [
                    { "name": "test-model", "size": 274_302_450_u64 },
                    { "name": "other-model" }
                ]
            })))
            .mount(&server)
            .await;

        let model = OllamaModel::new(client_for(&server, 16), 2);
        model.health_check().await.expect("health check should pass");

        let client = model.client().clone();
        let models = tokio::task::spawn_blocking(move || client.list_models())
            .await
            .expect("task should join")
            .expect("listing should succeed");
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].size, Some(274_302_450));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_check_rejects_missing_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{ "name": "other-model" }]
            })))
            .mount(&server)
            .await;

        let model = OllamaModel::new(client_for(&server, 16), 2);
        let err = model.health_check().await.expect_err("model is missing");
        assert!(err.to_string().contains("test-model"));
    }
}
