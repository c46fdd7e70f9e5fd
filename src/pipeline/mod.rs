//! Inbound message processing pipeline.
//!
//! Every provider message, whether pulled by a sync or named by a push
//! notification, flows through:
//! 1. `Ingestor`: dedup by provider id, correlate into a thread
//! 2. Classification via the `ClassificationGateway` (fail-safe to review)
//! 3. `RulesEngine::select()`: priority-ordered, first match wins
//! 4. `ActionDispatcher`: draft, send, task, close or ignore
//!
//! Per-message failures become `ItemOutcome::Failed` and never abort a batch.

pub mod actions;
pub mod context;
pub mod followup;
pub mod ingest;
pub mod rules;
pub mod types;

pub use actions::{ActionDispatcher, ActionEffect};
pub use context::{PipelineDeps, RunContext, RunKind};
pub use followup::{FollowUpOutcome, FollowUpRunner};
pub use ingest::Ingestor;
pub use rules::{AutoReplyRule, ReplyMode, RuleAction, RuleTriggers, RulesEngine};
pub use types::{ItemOutcome, Message, MessageDirection, MessageStatus, SyncReport};
