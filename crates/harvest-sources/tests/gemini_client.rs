use harvest_core::build_prompts;
use harvest_sources::{Completion, CompletionService, GeminiClient, GenerationAdapter, GenerationOutcome};
use harvest_storage::HttpClientConfig;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ENDPOINT: &str = "/v1beta/models/gemini-2.0-flash:generateContent";

fn client(server: &MockServer) -> GeminiClient {
    GeminiClient::new(
        &server.uri(),
        "test-key",
        "gemini-2.0-flash",
        HttpClientConfig::default(),
    )
    .expect("client")
}

#[tokio::test]
async fn completion_posts_prompt_with_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .and(header("x-goog-api-key", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "What triggers this workflow?\n" }] },
                "finishReason": "STOP"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let completion = client(&server).complete("prompt").await.expect("completion");
    assert_eq!(
        completion,
        Completion::Text("What triggers this workflow?\n".into())
    );
}

#[tokio::test]
async fn adapter_turns_blocked_and_failed_calls_into_outcomes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ENDPOINT))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let adapter = GenerationAdapter::new(Box::new(client(&server)));
    let prompt = build_prompts("on: push", 1).remove(0);

    assert!(matches!(
        adapter.generate(&prompt).await,
        GenerationOutcome::Blocked(_)
    ));
    let failed = adapter.generate(&prompt).await;
    assert!(matches!(failed, GenerationOutcome::TransportFailure(_)));
    assert_eq!(failed.into_question(), "");
}
