//! Integration tests for the LiteLLM client and the repair agent.
//!
//! These tests make real API calls.
//! Run with: LITELLM_API_BASE=http://localhost:4000 cargo test --test llm_integration -- --ignored

use std::sync::Arc;

use buildloop::fix::{
    CodeContext, FixConfig, LlmRepairAgent, PatchParser, RepairAgent, RepairContext, TestFailure,
    TestSpec,
};
use buildloop::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};

fn create_test_client() -> LiteLlmClient {
    LiteLlmClient::from_env().expect("LITELLM_API_BASE environment variable must be set for integration tests")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_generation() {
    let client = create_test_client();

    let request = GenerationRequest::new(
        client.default_model().to_string(),
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = client.generate(request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());

    let response = response.expect("Should have response");
    let content = response.first_content().expect("Should have content");
    assert!(content.contains('4'), "Response should contain '4', got: {}", content);
    assert!(response.usage.total_tokens > 0, "Should have token usage");
}

#[tokio::test]
#[ignore]
async fn test_repair_agent_produces_parseable_patch() {
    let llm: Arc<dyn LlmProvider> = Arc::new(create_test_client());
    let agent = LlmRepairAgent::new(llm, &FixConfig::default());

    let code = CodeContext::new("/tmp/ws", TestSpec::framework("cargo"))
        .with_language("rust")
        .with_file(
            "src/lib.rs",
            "pub fn add(a: i32, b: i32) -> i32 { a - b }\n\n#[test]\nfn adds() { assert_eq!(add(2, 2), 4); }\n",
        );
    let ctx = RepairContext {
        job_id: "integration".to_string(),
        iteration: 1,
        max_iterations: 3,
        failure: TestFailure::new("assertion failed: left == right (left: 0, right: 4)")
            .with_failing_tests(vec!["adds".to_string()]),
        code,
        previous_attempts: Vec::new(),
    };

    let response = agent.generate(&ctx).await.expect("repair suggestion");
    let patch = PatchParser::default()
        .parse(&response.text, response.provenance)
        .expect("parseable patch");
    assert!(patch.changes.iter().any(|c| c.file == "src/lib.rs"));
}
