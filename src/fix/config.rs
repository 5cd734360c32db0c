//! Self-fix loop configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// What to do when some changes of a patch fail to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialApplyPolicy {
    /// Run the tests anyway; the failures are recorded on the attempt.
    #[default]
    ProceedToTests,
    /// End the iteration with a `PatchApplication` fault.
    AbortIteration,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
        }
    }
}

impl TokenPricing {
    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        (prompt_tokens as f64 * self.input_per_million
            + completion_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixConfig {
    pub max_iterations: u32,
    pub partial_apply: PartialApplyPolicy,
    /// Wall-clock budget per iteration; `None` means unbounded.
    #[serde(with = "opt_duration_ms", rename = "iteration_timeout_ms")]
    pub iteration_timeout: Option<Duration>,
    /// Finished sessions kept for `get_session`.
    pub history_capacity: usize,
    /// Model requested from the repair provider; empty uses its default.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub pricing: TokenPricing,
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            partial_apply: PartialApplyPolicy::default(),
            iteration_timeout: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            model: String::new(),
            temperature: 0.2,
            max_tokens: 4096,
            pricing: TokenPricing::default(),
        }
    }
}

impl FixConfig {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_partial_apply(mut self, policy: PartialApplyPolicy) -> Self {
        self.partial_apply = policy;
        self
    }

    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
