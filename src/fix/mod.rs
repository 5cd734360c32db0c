//! Self-fix loop: bounded automatic repair of failing generated code.
//!
//! [`SelfFixLoop`] runs an iterate-patch-test cycle per failing job and files
//! an [`Escalation`] for human review when it runs out of iterations. Its
//! collaborators are traits so that each can be swapped or stubbed:
//!
//! - [`RepairAgent`]: proposes a patch ([`LlmRepairAgent`] over any
//!   [`LlmProvider`](crate::llm::LlmProvider))
//! - [`PatchApplier`]: applies one change ([`FsWorkspace`])
//! - [`TestRunner`]: runs the tests ([`CommandTestRunner`])

pub mod config;
pub mod engine;
pub mod escalation;
pub mod parser;
pub mod repair;
pub mod runner;
pub mod types;
pub mod workspace;

pub use config::{FixConfig, PartialApplyPolicy, TokenPricing, DEFAULT_MAX_ITERATIONS};
pub use engine::SelfFixLoop;
pub use escalation::{
    Escalation, EscalationStatus, EscalationStore, EscalationSummary, ErrorFingerprint, Resolution,
};
pub use parser::{DiffStrategy, FencedJsonStrategy, JsonStrategy, PatchParser, PatchStrategy, RawPatch};
pub use repair::{AttemptSummary, LlmRepairAgent, RepairAgent, RepairContext, RepairResponse};
pub use runner::{default_command, CommandTestRunner, TestRunner};
pub use types::{
    Attempt, AttemptStatus, Change, ChangeAction, ChangeFormat, CodeContext, FileOutcome,
    FixOutcome, FixSession, FixStats, Hunk, Patch, PatchResult, Provenance, SessionStatus,
    SourceFile, TestFailure, TestResult, TestSpec,
};
pub use workspace::{collect_sources, FsWorkspace, PatchApplier};
