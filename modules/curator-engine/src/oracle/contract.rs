//! The strict response contract for oracle output.
//!
//! Structural problems (not JSON, missing or mistyped fields, unknown decision)
//! are [`ContractViolation`]s and count against the retry budget. Data problems
//! inside an otherwise well-formed response (unknown ids, self-pairs) are
//! dropped with a warning and the rest of the response proceeds.

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ai_client::{json_object_span, strip_code_blocks};
use curator_common::{DecisionKind, MergePair, MergedContent, RecordId, ValidationStatus, Verdict};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractViolation {
    #[error("response is not valid JSON: {0}")]
    NotJson(String),

    #[error("response is not a JSON object")]
    NotObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("unknown decision `{0}`")]
    UnknownDecision(String),

    #[error("{0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Wire schemas (tool input schemas for the Claude oracle)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WireDecision {
    MergeAll,
    MergeSubset,
    KeepSeparate,
    ManualReview,
}

/// Merge verdict for one community.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecisionWire {
    pub decision: WireDecision,
    /// Pairs of member ids to merge. Required and non-empty for merge decisions.
    #[serde(default)]
    pub merges: Option<Vec<[String; 2]>>,
    pub notes: String,
    /// 0.0 to 1.0
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AtomicPart {
    pub title: String,
    pub body: String,
}

/// Whether a record holds a single unit of guidance, and its parts if not.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AtomicityWire {
    pub atomic: bool,
    #[serde(default)]
    pub parts: Vec<AtomicPart>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Content for the record that replaces a merged group.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SynthesisWire {
    pub title: String,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDecision {
    pub verdict: Verdict,
    pub notes: String,
    pub confidence: Option<f64>,
    pub validation: ValidationStatus,
    pub warnings: Vec<String>,
}

/// Validate a raw decision response against the members of the community it
/// was asked about.
pub fn validate_decision(
    raw: &str,
    members: &[RecordId],
) -> Result<ValidatedDecision, ContractViolation> {
    let object = parse_object(raw)?;

    let decision = match object.get("decision") {
        None | Some(Value::Null) => return Err(ContractViolation::MissingField("decision")),
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(ContractViolation::WrongType {
                field: "decision",
                expected: "a string",
            })
        }
    };
    let kind =
        DecisionKind::from_wire(&decision).ok_or(ContractViolation::UnknownDecision(decision))?;

    let notes = match object.get("notes") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(_) => {
            return Err(ContractViolation::WrongType {
                field: "notes",
                expected: "a string",
            })
        }
    };

    let confidence = match object.get("confidence") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64().map(|c| c.clamp(0.0, 1.0)),
        Some(_) => {
            return Err(ContractViolation::WrongType {
                field: "confidence",
                expected: "a number",
            })
        }
    };

    let mut warnings = Vec::new();
    let mut validation = ValidationStatus::Valid;

    let verdict = if kind.is_merge() {
        let raw_merges = match object.get("merges") {
            None | Some(Value::Null) => return Err(ContractViolation::MissingField("merges")),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ContractViolation::WrongType {
                    field: "merges",
                    expected: "an array of id pairs",
                })
            }
        };

        let (pairs, dropped) = filter_pairs(raw_merges, members);
        if !dropped.is_empty() {
            validation = ValidationStatus::Downgraded;
            warnings.extend(dropped);
        }

        if pairs.is_empty() {
            validation = ValidationStatus::Downgraded;
            warnings.push(format!(
                "{kind} has no valid merge pair; downgraded to keep_separate"
            ));
            Verdict::KeepSeparate
        } else if kind == DecisionKind::MergeAll {
            Verdict::MergeAll { merges: pairs }
        } else {
            Verdict::MergeSubset { merges: pairs }
        }
    } else {
        if let Some(Value::Array(items)) = object.get("merges") {
            if !items.is_empty() {
                warnings.push(format!(
                    "{kind} carried {} merge pair(s); ignored",
                    items.len()
                ));
            }
        }
        match kind {
            DecisionKind::KeepSeparate => Verdict::KeepSeparate,
            _ => Verdict::ManualReview,
        }
    };

    Ok(ValidatedDecision {
        verdict,
        notes,
        confidence,
        validation,
        warnings,
    })
}

/// Keep well-formed pairs of distinct community members, in order, without
/// duplicates. Returns the kept pairs and a warning per dropped entry.
fn filter_pairs(items: &[Value], members: &[RecordId]) -> (Vec<MergePair>, Vec<String>) {
    let known: HashSet<&str> = members.iter().map(String::as_str).collect();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut pairs = Vec::new();
    let mut dropped = Vec::new();

    for item in items {
        let ids: Option<Vec<&str>> = item
            .as_array()
            .and_then(|a| a.iter().map(Value::as_str).collect::<Option<Vec<_>>>());
        let (a, b) = match ids.as_deref() {
            Some([a, b]) => (*a, *b),
            _ => {
                dropped.push(format!("dropped malformed merge entry {item}"));
                continue;
            }
        };
        if a == b {
            dropped.push(format!("dropped self-pair [{a}, {b}]"));
            continue;
        }
        let unknown: Vec<&str> = [a, b].into_iter().filter(|id| !known.contains(id)).collect();
        if !unknown.is_empty() {
            dropped.push(format!(
                "dropped pair [{a}, {b}]: unknown member id(s) {}",
                unknown.join(", ")
            ));
            continue;
        }
        let key = if a < b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        if seen.insert(key) {
            pairs.push(MergePair(a.to_string(), b.to_string()));
        }
    }
    (pairs, dropped)
}

// ---------------------------------------------------------------------------
// Atomicity and synthesis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum AtomicityVerdict {
    Atomic,
    Split { parts: Vec<AtomicPart>, notes: String },
}

pub fn validate_atomicity(raw: &str) -> Result<AtomicityVerdict, ContractViolation> {
    let wire: AtomicityWire = parse_typed(raw)?;
    if wire.atomic {
        return Ok(AtomicityVerdict::Atomic);
    }
    let parts: Vec<AtomicPart> = wire
        .parts
        .into_iter()
        .map(|p| AtomicPart {
            title: p.title.trim().to_string(),
            body: p.body.trim().to_string(),
        })
        .filter(|p| !p.title.is_empty() && !p.body.is_empty())
        .collect();
    if parts.len() < 2 {
        return Err(ContractViolation::Invalid(format!(
            "non-atomic verdict needs at least two non-empty parts, got {}",
            parts.len()
        )));
    }
    Ok(AtomicityVerdict::Split {
        parts,
        notes: wire.notes.unwrap_or_default(),
    })
}

pub fn validate_synthesis(raw: &str) -> Result<MergedContent, ContractViolation> {
    let wire: SynthesisWire = parse_typed(raw)?;
    let title = wire.title.trim().to_string();
    let body = wire.body.trim().to_string();
    if title.is_empty() || body.is_empty() {
        return Err(ContractViolation::Invalid(
            "merged record needs a non-empty title and body".to_string(),
        ));
    }
    Ok(MergedContent { title, body })
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_object(raw: &str) -> Result<Map<String, Value>, ContractViolation> {
    let body = strip_code_blocks(raw);
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(first) => json_object_span(raw)
            .and_then(|span| serde_json::from_str(span).ok())
            .ok_or_else(|| ContractViolation::NotJson(first.to_string()))?,
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ContractViolation::NotObject),
    }
}

fn parse_typed<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, ContractViolation> {
    let object = parse_object(raw)?;
    serde_json::from_value(Value::Object(object))
        .map_err(|e| ContractViolation::Invalid(e.to_string()))
}
