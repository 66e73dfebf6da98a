use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{AtomicityRequest, DecisionRequest, MergeRequest};
use crate::traits::DecisionOracle;

/// Offline oracle. Sends every community to manual review, treats every
/// record as atomic, and synthesizes by concatenation. Deterministic, so a
/// dry run against it is reproducible.
#[derive(Debug, Default, Clone)]
pub struct StubOracle;

#[async_trait]
impl DecisionOracle for StubOracle {
    fn name(&self) -> &str {
        "stub"
    }

    async fn decide(&self, request: &DecisionRequest) -> Result<String> {
        Ok(json!({
            "decision": "manual_review",
            "notes": format!("stub oracle: {} members need a human decision", request.members.len()),
        })
        .to_string())
    }

    async fn check_atomicity(&self, _request: &AtomicityRequest) -> Result<String> {
        Ok(json!({ "atomic": true, "parts": [] }).to_string())
    }

    async fn synthesize(&self, request: &MergeRequest) -> Result<String> {
        let title = request
            .sources
            .first()
            .map(|s| s.title.clone())
            .unwrap_or_default();
        let body = request
            .sources
            .iter()
            .map(|s| s.body.trim())
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(json!({ "title": title, "body": body }).to_string())
    }
}
