//! Auto-reply rules engine: priority-ordered, first match wins.
//!
//! Rules belong to a mailbox and are evaluated against the thread's
//! classification and the inbound message's subject and sender. Every
//! predicate a rule declares must hold; an absent predicate matches anything.
//! Ties on `priority` resolve by `created_at`, then `id`.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline::types::Message;
use crate::threads::model::{Classification, Thread};

/// How the reply body for a rule is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplyMode {
    /// Static text with `{sender_name}`, `{subject}` and `{mailbox}` placeholders.
    Template { text: String },
    /// Generated by the classification gateway, optionally steered by
    /// extra instructions.
    AiGenerated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
}

/// What a matched rule does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    CreateDraft { reply: ReplyMode },
    /// Downgraded to a draft when the mailbox is in draft mode.
    SendImmediately { reply: ReplyMode },
    CreateTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    MarkAsHandled,
    Ignore,
}

impl RuleAction {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateDraft { .. } => "create_draft",
            Self::SendImmediately { .. } => "send_immediately",
            Self::CreateTask { .. } => "create_task",
            Self::MarkAsHandled => "mark_as_handled",
            Self::Ignore => "ignore",
        }
    }
}

/// Trigger predicates. Empty / absent means "matches anything".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTriggers {
    #[serde(default)]
    pub classifications: Vec<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_pattern: Option<String>,
}

/// A configured auto-reply rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoReplyRule {
    pub id: Uuid,
    pub mailbox_id: Uuid,
    pub name: String,
    /// Ordering key, lower runs first.
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub triggers: RuleTriggers,
    #[serde(flatten)]
    pub action: RuleAction,
    /// Schedule a follow-up this many hours after the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_after_hours: Option<u32>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl AutoReplyRule {
    pub fn new(mailbox_id: Uuid, name: impl Into<String>, priority: i32, action: RuleAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            mailbox_id,
            name: name.into(),
            priority,
            is_active: true,
            triggers: RuleTriggers::default(),
            action,
            follow_up_after_hours: None,
            created_at: Utc::now(),
        }
    }

    /// Builder: restrict to these classifications.
    pub fn for_classifications(mut self, classifications: &[Classification]) -> Self {
        self.triggers.classifications = classifications.to_vec();
        self
    }

    /// Builder: require the subject to match a (case-insensitive) pattern.
    pub fn with_subject_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.triggers.subject_pattern = Some(pattern.into());
        self
    }

    /// Builder: require the sender address to match a (case-insensitive) pattern.
    pub fn with_from_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.triggers.from_pattern = Some(pattern.into());
        self
    }

    /// Builder: schedule a follow-up after the action.
    pub fn with_follow_up(mut self, hours: u32) -> Self {
        self.follow_up_after_hours = Some(hours);
        self
    }

    /// Builder: set creation time (used for tie-breaks).
    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

/// A rule with its patterns compiled once.
#[derive(Debug, Clone)]
struct CompiledRule {
    rule: AutoReplyRule,
    subject: Option<Regex>,
    from: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: AutoReplyRule) -> Result<Self, regex::Error> {
        let subject = rule
            .triggers
            .subject_pattern
            .as_deref()
            .map(case_insensitive)
            .transpose()?;
        let from = rule
            .triggers
            .from_pattern
            .as_deref()
            .map(case_insensitive)
            .transpose()?;
        Ok(Self {
            rule,
            subject,
            from,
        })
    }

    fn matches(&self, classification: Classification, subject: &str, from: &str) -> bool {
        let triggers = &self.rule.triggers;
        if !triggers.classifications.is_empty() && !triggers.classifications.contains(&classification)
        {
            return false;
        }
        if let Some(re) = &self.subject
            && !re.is_match(subject)
        {
            return false;
        }
        if let Some(re) = &self.from
            && !re.is_match(from)
        {
            return false;
        }
        true
    }
}

fn case_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Ordered, compiled rule set for one mailbox.
pub struct RulesEngine {
    rules: Vec<CompiledRule>,
    skipped: Vec<Uuid>,
}

impl RulesEngine {
    /// Build from raw rules. Inactive rules are dropped; rules whose
    /// patterns do not compile are skipped with a warning.
    pub fn new(rules: Vec<AutoReplyRule>) -> Self {
        let mut active: Vec<AutoReplyRule> = rules.into_iter().filter(|r| r.is_active).collect();
        active.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let mut compiled = Vec::with_capacity(active.len());
        let mut skipped = Vec::new();
        for rule in active {
            let id = rule.id;
            match CompiledRule::compile(rule) {
                Ok(c) => compiled.push(c),
                Err(e) => {
                    warn!(rule = %id, error = %e, "Skipping rule with invalid pattern");
                    skipped.push(id);
                }
            }
        }

        Self {
            rules: compiled,
            skipped,
        }
    }

    /// First rule whose predicates all match, if any.
    pub fn select(&self, thread: &Thread, message: &Message) -> Option<&AutoReplyRule> {
        let hit = self
            .rules
            .iter()
            .find(|r| r.matches(thread.classification, &message.subject, &message.from_address))
            .map(|r| &r.rule);
        if let Some(rule) = hit {
            debug!(rule = %rule.id, name = %rule.name, thread = %thread.id, "Rule matched");
        }
        hit
    }

    /// Rules dropped because a pattern failed to compile.
    pub fn skipped(&self) -> &[Uuid] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
