//! Discovery through the HTTP adapters
//!
//! Runs the discovery workflow with the OpenAI-compatible provider and the
//! ClinicalTrials.gov client, both pointed at local mock servers.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use trialmatch::config::SearchSection;
use trialmatch::llm::{OpenAiConfig, OpenAiProvider};
use trialmatch::testing::sample_profile;
use trialmatch::tools::ClinicalTrialsClient;
use trialmatch::{MatcherConfig, TrialMatcher};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn study(nct_id: &str, status: &str) -> Value {
    json!({
        "protocolSection": {
            "identificationModule": {"nctId": nct_id, "briefTitle": format!("Cervical Study {nct_id}")},
            "statusModule": {"overallStatus": status},
            "descriptionModule": {"briefSummary": "Chemoradiation with pembrolizumab"},
            "designModule": {"phases": ["PHASE3"]},
            "eligibilityModule": {"minimumAge": "18 Years", "sex": "FEMALE"},
            "contactsLocationsModule": {"locations": [{"city": "Houston", "state": "Texas", "country": "United States"}]}
        }
    })
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "gpt-4o",
        "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 120}
    }))
}

async fn registry_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "studies": [study("NCT00000010", "RECRUITING"), study("NCT00000011", "COMPLETED")]
        })))
        .mount(&server)
        .await;
    server
}

fn matcher_for(llm_server: &MockServer, registry: &MockServer) -> TrialMatcher {
    let provider = OpenAiProvider::new(OpenAiConfig {
        api_key: "test-key".to_string(),
        base_url: llm_server.uri(),
        timeout: Duration::from_secs(5),
    })
    .unwrap();
    let search = ClinicalTrialsClient::new(&SearchSection {
        base_url: registry.uri(),
        ..Default::default()
    })
    .unwrap();
    TrialMatcher::new(MatcherConfig::default(), Arc::new(provider), Arc::new(search))
}

#[tokio::test]
async fn test_discovery_over_http_adapters() {
    let llm_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("search query optimizer"))
        .respond_with(completion(
            r#"```json
["cervical cancer", "advanced cervical cancer", "cervical carcinoma"]
```"#,
        ))
        .mount(&llm_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("relevance scorer"))
        .respond_with(completion(r#"Here you go: {"1": 88}"#))
        .mount(&llm_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(completion("Summaries are not available right now."))
        .with_priority(10)
        .mount(&llm_server)
        .await;
    let registry = registry_server().await;

    let result = matcher_for(&llm_server, &registry)
        .run_trial_discovery(&sample_profile())
        .await;

    assert!(result.success, "discovery failed: {:?}", result.error);
    assert_eq!(result.counts.raw, 6);
    assert_eq!(result.counts.unique, 2);
    assert_eq!(result.total_found, 1);
    assert_eq!(result.ranked_trials[0].nct_id, "NCT00000010");
    assert_eq!(result.ranked_trials[0].location, "Houston, Texas");
    assert_eq!(result.top_score, 88.0);
    assert_eq!(result.summaries.len(), 1);
    assert!(!result.summaries[0].model_enriched);
}

#[tokio::test]
async fn test_rejected_api_key_degrades_to_fallbacks() {
    let llm_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&llm_server)
        .await;
    let registry = registry_server().await;

    let result = matcher_for(&llm_server, &registry)
        .run_trial_discovery(&sample_profile())
        .await;

    assert!(result.success);
    assert_eq!(result.counts.raw, 10);
    assert_eq!(result.total_found, 1);
    assert_eq!(result.top_score, 50.0);
}
