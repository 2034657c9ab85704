//! The résumé-processing pipeline core.
//!
//! One `PipelineContext` per job, owned by the orchestrator; every stage
//! receives a mutable borrow. Sub-stores (evidence, decisions, warnings,
//! audit, guardrails) communicate only through the context.

pub mod audit;
pub mod context;
pub mod decision;
pub mod evidence;
pub mod guardrails;
pub mod hallucination;
pub mod layers;
pub mod orchestrator;
pub mod warnings;

pub use context::{FinalizedResult, PipelineContext};
pub use decision::{Decision, DecisionManager, DecisionMethod, Proposal};
pub use evidence::{Evidence, EvidenceStore};
pub use guardrails::{GuardrailChecker, PipelineGuardrails};
pub use hallucination::{HallucinationDetector, HallucinationRecord};
pub use layers::{CurrentData, ParsedData, PiiStore, RawInput, StageResults, StageStatus};
pub use orchestrator::{
    OrchestratorOutcome, PipelineOrchestrator, PipelineRequest, ProcessTextRequest,
};
pub use warnings::{PipelineWarning, WarningCode, WarningCollector, WarningSeverity};
