//! Human escalation bundles.
//!
//! When a session exhausts its iterations, the loop files an [`Escalation`]
//! that stands on its own: the original failure, every attempt with its patch
//! provenance, cumulative cost and duration, and the distinct errors seen.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FixError;
use crate::utils::BoundedLog;

use super::config::DEFAULT_HISTORY_CAPACITY;
use super::types::{Attempt, AttemptStatus, TestFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    PendingHumanReview,
    Resolved,
}

/// A distinct error seen across the attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFingerprint {
    /// First 12 hex characters of the SHA-256 of the normalized message.
    pub fingerprint: String,
    pub occurrences: u32,
    /// The first raw message with this fingerprint.
    pub sample: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationSummary {
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub total_duration_ms: u64,
    pub providers: Vec<String>,
    pub models: Vec<String>,
    pub error_fingerprints: Vec<ErrorFingerprint>,
}

/// How a human closed an escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_by: String,
    pub notes: String,
    #[serde(default = "Utc::now")]
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    pub fn new(resolved_by: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            resolved_by: resolved_by.into(),
            notes: notes.into(),
            resolved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub job_id: String,
    pub reason: String,
    pub iterations: u32,
    pub original_failure: TestFailure,
    pub attempts: Vec<Attempt>,
    pub summary: EscalationSummary,
    pub status: EscalationStatus,
    pub resolution: Option<Resolution>,
    pub created_at: DateTime<Utc>,
}

impl Escalation {
    pub(crate) fn build(
        job_id: &str,
        reason: impl Into<String>,
        original_failure: TestFailure,
        attempts: Vec<Attempt>,
    ) -> Self {
        let summary = summarize(&original_failure, &attempts);
        Self {
            job_id: job_id.to_string(),
            reason: reason.into(),
            iterations: attempts.len() as u32,
            original_failure,
            attempts,
            summary,
            status: EscalationStatus::PendingHumanReview,
            resolution: None,
            created_at: Utc::now(),
        }
    }
}

fn volatile_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+|\d+").ok())
        .as_ref()
}

/// Lowercases, masks numbers and addresses, and collapses whitespace so that
/// the same error from different runs fingerprints identically.
pub fn normalize_error(message: &str) -> String {
    let lowered = message.trim().to_lowercase();
    let masked = match volatile_regex() {
        Some(re) => re.replace_all(&lowered, "#").into_owned(),
        None => lowered,
    };
    masked.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn fingerprint(message: &str) -> String {
    let digest = Sha256::digest(normalize_error(message).as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Error lines contributed by one attempt.
fn attempt_errors(attempt: &Attempt) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(error) = &attempt.error {
        errors.push(error.clone());
    }
    if attempt.status != AttemptStatus::Success {
        if let Some(result) = &attempt.test_result {
            if let Some(error) = &result.error {
                errors.push(error.clone());
            }
            errors.extend(
                result
                    .failing_tests
                    .iter()
                    .map(|test| format!("test failed: {}", test)),
            );
        }
    }
    errors
}

fn summarize(original: &TestFailure, attempts: &[Attempt]) -> EscalationSummary {
    let mut summary = EscalationSummary::default();
    let mut providers = BTreeSet::new();
    let mut models = BTreeSet::new();
    let mut fingerprints: Vec<ErrorFingerprint> = Vec::new();

    let mut record = |message: &str| {
        let fp = fingerprint(message);
        match fingerprints.iter_mut().find(|f| f.fingerprint == fp) {
            Some(existing) => existing.occurrences += 1,
            None => fingerprints.push(ErrorFingerprint {
                fingerprint: fp,
                occurrences: 1,
                sample: message.to_string(),
            }),
        }
    };

    if !original.message.is_empty() {
        record(&original.message);
    }

    for attempt in attempts {
        if let Some(patch) = &attempt.patch {
            let p = &patch.provenance;
            summary.total_cost_usd += p.cost_usd;
            summary.total_tokens += p.total_tokens();
            if !p.provider.is_empty() {
                providers.insert(p.provider.clone());
            }
            if !p.model.is_empty() {
                models.insert(p.model.clone());
            }
        }
        if let Some(duration) = attempt.duration() {
            summary.total_duration_ms += duration.num_milliseconds().max(0) as u64;
        }
        for error in attempt_errors(attempt) {
            record(&error);
        }
    }

    summary.providers = providers.into_iter().collect();
    summary.models = models.into_iter().collect();
    summary.error_fingerprints = fingerprints;
    summary
}

/// Escalations keyed by job id. Filing again for the same job replaces the
/// previous pending bundle. Resolved bundles move to a bounded log, so only
/// the most recent `resolved_capacity` of them are kept.
#[derive(Debug)]
pub struct EscalationStore {
    pending: Mutex<HashMap<String, Escalation>>,
    resolved: Mutex<BoundedLog<Escalation>>,
}

impl Default for EscalationStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl EscalationStore {
    pub fn new(resolved_capacity: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            resolved: Mutex::new(BoundedLog::new(resolved_capacity)),
        }
    }

    pub fn insert(&self, escalation: Escalation) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(escalation.job_id.clone(), escalation);
    }

    /// The pending bundle for `job_id`, else its most recently resolved one.
    pub fn get(&self, job_id: &str) -> Option<Escalation> {
        if let Some(escalation) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
        {
            return Some(escalation.clone());
        }
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .find_latest(|e| e.job_id == job_id)
            .cloned()
    }

    /// Pending escalations, oldest first.
    pub fn pending(&self) -> Vec<Escalation> {
        let mut pending: Vec<Escalation> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending
    }

    /// Marks a pending escalation resolved.
    pub fn resolve(&self, job_id: &str, resolution: Resolution) -> Result<Escalation, FixError> {
        let mut escalation = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id)
            .ok_or_else(|| FixError::EscalationNotFound(job_id.to_string()))?;

        escalation.status = EscalationStatus::Resolved;
        escalation.resolution = Some(resolution);
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(escalation.clone());
        Ok(escalation)
    }

    /// Pending plus retained resolved bundles.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
            + self.resolved.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::types::{Change, Patch, Provenance, TestResult};

    fn attempt(iteration: u32, cost: f64, model: &str, failing: &[&str]) -> Attempt {
        let mut attempt = Attempt::start(iteration);
        attempt.patch = Some(Patch {
            analysis: String::new(),
            changes: vec![Change::delete("x")],
            description: format!("try {}", iteration),
            confidence: 0.5,
            provenance: Provenance {
                provider: "litellm".to_string(),
                model: model.to_string(),
                cost_usd: cost,
                prompt_tokens: 100,
                completion_tokens: 50,
                latency_ms: 10,
            },
        });
        attempt.test_result = Some(TestResult::failed(
            "",
            failing.iter().map(|t| t.to_string()).collect(),
        ));
        attempt.status = AttemptStatus::Failed;
        attempt.finished_at = Some(attempt.started_at + chrono::Duration::milliseconds(250));
        attempt
    }

    #[test]
    fn test_normalize_and_fingerprint() {
        assert_eq!(
            normalize_error("  Panicked at src/lib.rs:42:7\n  0xDEADbeef  "),
            "panicked at src/lib.rs:#:# #"
        );
        assert_eq!(fingerprint("timeout after 30s"), fingerprint("Timeout after 45s"));
        assert_ne!(fingerprint("timeout"), fingerprint("assertion failed"));
        assert_eq!(fingerprint("x").len(), 12);
    }

    #[test]
    fn test_summary_aggregates_attempts() {
        let escalation = Escalation::build(
            "job-1",
            "max iterations reached",
            TestFailure::new("1 test(s) failed"),
            vec![
                attempt(1, 0.01, "model-a", &["tests::adds"]),
                attempt(2, 0.02, "model-b", &["tests::adds"]),
            ],
        );

        let summary = &escalation.summary;
        assert_eq!(escalation.iterations, 2);
        assert!((summary.total_cost_usd - 0.03).abs() < 1e-9);
        assert_eq!(summary.total_tokens, 300);
        assert_eq!(summary.total_duration_ms, 500);
        assert_eq!(summary.providers, vec!["litellm".to_string()]);
        assert_eq!(summary.models, vec!["model-a".to_string(), "model-b".to_string()]);
        assert_eq!(summary.error_fingerprints.len(), 2);
        assert_eq!(summary.error_fingerprints[1].occurrences, 2);
        assert_eq!(summary.error_fingerprints[1].sample, "test failed: tests::adds");
    }

    #[test]
    fn test_resolve_transitions_once() {
        let store = EscalationStore::default();
        store.insert(Escalation::build("job-1", "exhausted", TestFailure::new("x"), vec![]));

        assert_eq!(store.pending().len(), 1);
        let resolved = store
            .resolve("job-1", Resolution::new("alice", "fixed by hand"))
            .expect("resolve");
        assert_eq!(resolved.status, EscalationStatus::Resolved);
        assert!(store.pending().is_empty());

        assert!(matches!(
            store.resolve("job-1", Resolution::new("bob", "")),
            Err(FixError::EscalationNotFound(_))
        ));
        assert!(matches!(
            store.resolve("missing", Resolution::new("bob", "")),
            Err(FixError::EscalationNotFound(_))
        ));
        assert_eq!(
            store.get("job-1").map(|e| e.status),
            Some(EscalationStatus::Resolved)
        );
    }

    #[test]
    fn test_resolved_bundles_are_bounded() {
        let store = EscalationStore::new(3);
        for i in 0..10 {
            let job_id = format!("job-{}", i);
            store.insert(Escalation::build(&job_id, "exhausted", TestFailure::new("x"), vec![]));
            store
                .resolve(&job_id, Resolution::new("alice", ""))
                .expect("resolve");
        }
        store.insert(Escalation::build("job-open", "exhausted", TestFailure::new("x"), vec![]));

        assert_eq!(store.len(), 4);
        assert_eq!(store.pending().len(), 1);
        assert!(store.get("job-0").is_none());
        assert!(store.get("job-9").is_some());
    }
}
