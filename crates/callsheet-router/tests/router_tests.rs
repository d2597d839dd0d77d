//! Router behavior tests: selection, fallback, sensitivity gating, and
//! cancellation over scripted providers, plus wire-level provider tests
//! against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use callsheet_core::config::{ProviderConfig, RouterConfig};
use callsheet_core::error::Error;
use callsheet_core::message::{AgentKind, ChatMessage};
use callsheet_core::principal::{Principal, Role};
use callsheet_router::test_support::{FakeChatProvider, FakeEmbeddings};
use callsheet_router::{
    ChatProvider, CompletionRequest, LlmRouter, OpenAiCompatibleProvider, RouteRequest, StreamDelta,
};

fn config() -> RouterConfig {
    RouterConfig {
        together: ProviderConfig {
            api_key: "k1".to_string(),
            default_model: "meta-llama/Meta-Llama-3.1-70B-Instruct-Turbo".to_string(),
            base_url: "http://localhost/v1".to_string(),
        },
        openai: ProviderConfig {
            api_key: "k2".to_string(),
            default_model: "gpt-4o".to_string(),
            base_url: "http://localhost/v1".to_string(),
        },
        trusted_providers: vec!["openai".to_string()],
        sensitivity_floor: 4,
        health_cooldown: Duration::from_secs(60),
    }
}

fn router_with(
    primary: Arc<FakeChatProvider>,
    secondary: Arc<FakeChatProvider>,
) -> LlmRouter {
    LlmRouter::new(
        vec![primary as Arc<dyn ChatProvider>, secondary as Arc<dyn ChatProvider>],
        Arc::new(FakeEmbeddings::new()),
        &config(),
    )
}

fn principal(level: u8) -> Principal {
    Principal::new("u1", Role::Salesperson, level).unwrap()
}

fn request() -> RouteRequest {
    RouteRequest::new(
        vec![ChatMessage::user("Who wrote the treatment for Boost Mobile?")],
        AgentKind::Sales,
    )
}

#[tokio::test]
async fn primary_serves_simple_queries() {
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    primary.respond("Courtney Phillips wrote it.");

    let router = router_with(Arc::clone(&primary), Arc::clone(&secondary));
    let response = router.route_query(&request(), &principal(2)).await.unwrap();

    assert_eq!(response.provider, "together");
    assert_eq!(response.content, "Courtney Phillips wrote it.");
    assert_eq!(primary.call_count(), 1);
    assert_eq!(secondary.call_count(), 0);
}

#[tokio::test]
async fn fallback_after_two_attempts_on_primary() {
    // scenario: primary 503s twice (initial + in-provider retry), secondary
    // succeeds; exactly one call lands on the secondary
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    primary
        .fail(|| Error::connection("together (503): overloaded"))
        .fail(|| Error::connection("together (503): overloaded"));
    secondary.respond("fallback response");

    let router = router_with(Arc::clone(&primary), Arc::clone(&secondary));
    let response = router.route_query(&request(), &principal(2)).await.unwrap();

    assert_eq!(response.provider, "openai");
    assert_eq!(response.content, "fallback response");
    assert_eq!(primary.call_count(), 2);
    assert_eq!(secondary.call_count(), 1);
}

#[tokio::test]
async fn exhausted_providers_carries_per_provider_errors() {
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    primary
        .fail(|| Error::connection("together down"))
        .fail(|| Error::connection("together down"));
    secondary
        .fail(|| Error::rate_limited("openai 429"))
        .fail(|| Error::rate_limited("openai 429"));

    let router = router_with(primary, secondary);
    let err = router.route_query(&request(), &principal(2)).await.unwrap_err();

    match err {
        Error::ExhaustedProviders { attempts } => {
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[0].provider, "together");
            assert_eq!(attempts[1].provider, "openai");
            assert!(attempts[1].error.contains("429"));
        }
        other => panic!("expected ExhaustedProviders, got {other:?}"),
    }
}

#[tokio::test]
async fn sensitivity_floor_restricts_to_trusted_set() {
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    secondary.respond("trusted answer");

    let router = router_with(Arc::clone(&primary), Arc::clone(&secondary));
    // high data-access principal, and even an explicit preference for the
    // untrusted provider must not override the floor
    let sensitive = principal(5);
    let req = request().with_preferred_provider("together");
    let response = router.route_query(&req, &sensitive).await.unwrap();

    assert_eq!(response.provider, "openai");
    assert_eq!(primary.call_count(), 0);
}

#[tokio::test]
async fn no_trusted_provider_is_provider_unavailable() {
    let mut config = config();
    config.trusted_providers = vec!["some-airgapped-provider".to_string()];
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    let router = LlmRouter::new(
        vec![
            primary as Arc<dyn ChatProvider>,
            secondary as Arc<dyn ChatProvider>,
        ],
        Arc::new(FakeEmbeddings::new()),
        &config,
    );

    let err = router.route_query(&request(), &principal(6)).await.unwrap_err();
    assert_eq!(err.code(), "provider_unavailable");
}

#[tokio::test]
async fn preferred_provider_honored_below_floor() {
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    secondary.respond("preferred answer");

    let router = router_with(Arc::clone(&primary), Arc::clone(&secondary));
    let req = request().with_preferred_provider("openai");
    let response = router.route_query(&req, &principal(2)).await.unwrap();

    assert_eq!(response.provider, "openai");
    assert_eq!(primary.call_count(), 0);
}

#[tokio::test]
async fn validation_errors_do_not_fall_through() {
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    primary.fail(|| Error::validation("context window exceeded"));

    let router = router_with(Arc::clone(&primary), Arc::clone(&secondary));
    let err = router.route_query(&request(), &principal(2)).await.unwrap_err();

    assert_eq!(err.code(), "validation");
    assert_eq!(secondary.call_count(), 0);
}

#[tokio::test]
async fn usage_is_recorded_per_provider() {
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    primary.respond("one two three");

    let router = router_with(primary, secondary);
    router.route_query(&request(), &principal(2)).await.unwrap();

    let usage = router.usage().usage_for("together");
    assert_eq!(usage.requests, 1);
    assert_eq!(usage.completion_tokens, 3);
    assert!(usage.cost_estimate > 0.0);
}

#[tokio::test]
async fn stream_yields_deltas_then_final() {
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    primary.respond("streamed answer here");

    let router = router_with(primary, secondary);
    let mut stream = router
        .stream_query(&request(), &principal(2), CancellationToken::new())
        .await
        .unwrap();

    let mut content = String::new();
    let mut saw_final = false;
    while let Some(delta) = stream.next().await {
        match delta.unwrap() {
            StreamDelta::Content(chunk) => {
                assert!(!saw_final, "content after final");
                content.push_str(&chunk);
            }
            StreamDelta::Final(trailer) => {
                saw_final = true;
                assert_eq!(trailer.provider, "together");
                assert!(trailer.usage.total_tokens > 0);
            }
            StreamDelta::ToolCall(_) => {}
        }
    }
    assert_eq!(content, "streamed answer here");
    assert!(saw_final);

    // the stream's trailer feeds the usage counters
    assert_eq!(router.usage().usage_for("together").requests, 1);
}

#[tokio::test]
async fn cancellation_stops_the_stream() {
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    primary.respond("a long answer with many many words to stream slowly");
    primary.with_delta_delay(Duration::from_millis(20));

    let router = router_with(primary, secondary);
    let cancel = CancellationToken::new();
    let mut stream = router
        .stream_query(&request(), &principal(2), cancel.clone())
        .await
        .unwrap();

    let mut deltas = 0;
    let mut cancelled = false;
    while let Some(delta) = stream.next().await {
        match delta {
            Ok(StreamDelta::Content(_)) => {
                deltas += 1;
                if deltas == 2 {
                    cancel.cancel();
                }
            }
            Ok(_) => {}
            Err(Error::Cancelled) => {
                cancelled = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert!(cancelled, "stream must surface cancellation");
    assert!(deltas < 5, "cancellation must stop deltas promptly");
    assert!(stream.next().await.is_none(), "no deltas after cancellation");
}

#[tokio::test]
async fn stream_establishment_falls_back() {
    let primary = Arc::new(FakeChatProvider::new("together"));
    let secondary = Arc::new(FakeChatProvider::new("openai"));
    primary.fail(|| Error::connection("connect reset"));
    secondary.respond("secondary stream");

    let router = router_with(primary, secondary);
    let mut stream = router
        .stream_query(&request(), &principal(2), CancellationToken::new())
        .await
        .unwrap();

    let mut provider = String::new();
    while let Some(delta) = stream.next().await {
        if let StreamDelta::Final(trailer) = delta.unwrap() {
            provider = trailer.provider;
        }
    }
    assert_eq!(provider, "openai");
}

// ---------------------------------------------------------------------------
// Wire-level tests against a mock HTTP server
// ---------------------------------------------------------------------------

fn provider_for(server: &MockServer, name: &str) -> OpenAiCompatibleProvider {
    OpenAiCompatibleProvider::new(
        name,
        &ProviderConfig {
            api_key: "test-key".to_string(),
            default_model: "m".to_string(),
            base_url: format!("{}/v1", server.uri()),
        },
    )
    .unwrap()
}

fn completion_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "cmpl-1",
        "model": "m",
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
}

#[tokio::test]
async fn provider_parses_completion_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("wire answer")))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server, "together");
    let response = provider
        .complete(&CompletionRequest::new(
            vec![ChatMessage::user("hello")],
            "m",
        ))
        .await
        .unwrap();

    assert_eq!(response.content, "wire answer");
    assert_eq!(response.usage.total_tokens, 15);
}

#[tokio::test]
async fn provider_maps_503_to_retryable_connection_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .mount(&server)
        .await;

    let provider = provider_for(&server, "together");
    let err = provider
        .complete(&CompletionRequest::new(vec![ChatMessage::user("hi")], "m"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "connection");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn router_falls_back_across_real_http_providers() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("boom"))
        .expect(2) // initial attempt + one in-provider retry
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("rescued")))
        .expect(1)
        .mount(&healthy)
        .await;

    let router = LlmRouter::new(
        vec![
            Arc::new(provider_for(&failing, "together")) as Arc<dyn ChatProvider>,
            Arc::new(provider_for(&healthy, "openai")) as Arc<dyn ChatProvider>,
        ],
        Arc::new(FakeEmbeddings::new()),
        &config(),
    );

    let response = router.route_query(&request(), &principal(2)).await.unwrap();
    assert_eq!(response.provider, "openai");
    assert_eq!(response.content, "rescued");
}

#[tokio::test]
async fn provider_streams_sse_chunks() {
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
        "data: [DONE]\n\n",
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(sse_body, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let provider = provider_for(&server, "openai");
    let mut stream = provider
        .stream(&CompletionRequest::new(vec![ChatMessage::user("hi")], "m"))
        .await
        .unwrap();

    let mut content = String::new();
    let mut trailer = None;
    while let Some(delta) = stream.next().await {
        match delta.unwrap() {
            StreamDelta::Content(chunk) => content.push_str(&chunk),
            StreamDelta::Final(f) => trailer = Some(f),
            StreamDelta::ToolCall(_) => {}
        }
    }

    assert_eq!(content, "Hello world");
    let trailer = trailer.expect("final trailer");
    assert_eq!(trailer.usage.total_tokens, 6);
    assert_eq!(trailer.provider, "openai");
}
