//! Inbox Ops: inbound mail triage, SLA tracking and follow-up automation.

pub mod config;
pub mod error;
pub mod gateways;
pub mod llm;
pub mod mailboxes;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod sla;
pub mod store;
pub mod tasks;
pub mod threads;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;
