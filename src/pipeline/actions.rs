//! Rule action dispatch.
//!
//! Each `RuleAction` variant maps to one handler. Handlers talk to the
//! gateways first and only then mutate the thread, so a failed action
//! leaves the in-memory thread as it was. Once a reply has been sent the
//! dispatch no longer fails: bookkeeping errors after that point are
//! logged and the thread keeps the sent state.

use chrono::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, PipelineError};
use crate::gateways::classifier::ReplyContext;
use crate::gateways::with_timeout;
use crate::mailboxes::model::Mailbox;
use crate::pipeline::context::{PipelineDeps, RunContext};
use crate::pipeline::rules::{AutoReplyRule, ReplyMode, RuleAction};
use crate::pipeline::types::{Message, MessageStatus};
use crate::scheduler::jobs::JobKind;
use crate::tasks::model::{Task, TaskType};
use crate::threads::model::Thread;
use crate::threads::state::ThreadStatus;

const DEFAULT_REPLY: &str =
    "Thank you for contacting us. Our team has received your message and will respond shortly.";

/// What a dispatched action produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionEffect {
    Drafted { message_id: Uuid },
    Sent { message_id: Uuid },
    TaskCreated { task_id: Uuid },
    Closed,
    MarkedSpam,
}

/// Applies a matched rule to a thread.
pub struct ActionDispatcher {
    deps: PipelineDeps,
}

impl ActionDispatcher {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Run `rule`'s action, then register its follow-up if the thread is
    /// still open. The caller persists `thread`.
    pub async fn dispatch(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        thread: &mut Thread,
        message: &Message,
        rule: &AutoReplyRule,
    ) -> Result<ActionEffect, Error> {
        let effect = match &rule.action {
            RuleAction::CreateDraft { reply } => {
                self.reply(ctx, mailbox, thread, message, rule, reply, false)
                    .await?
            }
            RuleAction::SendImmediately { reply } => {
                // The mailbox setting wins over the rule.
                let send = !mailbox.draft_mode_default;
                self.reply(ctx, mailbox, thread, message, rule, reply, send)
                    .await?
            }
            RuleAction::CreateTask { title } => {
                self.create_task(ctx, thread, rule, title.as_deref())
                    .await?
            }
            RuleAction::MarkAsHandled => {
                thread.transition_to(ThreadStatus::Closed, ctx.now)?;
                ActionEffect::Closed
            }
            RuleAction::Ignore => {
                thread.transition_to(ThreadStatus::Spam, ctx.now)?;
                ActionEffect::MarkedSpam
            }
        };

        if let Some(hours) = rule.follow_up_after_hours {
            if !thread.is_terminal() {
                if let Err(e) = self.schedule_follow_up(ctx, thread, hours).await {
                    warn!(thread = %thread.id, error = %e, "Follow-up not scheduled");
                }
            }
        }

        info!(
            thread = %thread.id,
            rule = %rule.name,
            action = rule.action.label(),
            status = %thread.status,
            "Rule applied"
        );
        Ok(effect)
    }

    #[allow(clippy::too_many_arguments)]
    async fn reply(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        thread: &mut Thread,
        message: &Message,
        rule: &AutoReplyRule,
        mode: &ReplyMode,
        send: bool,
    ) -> Result<ActionEffect, Error> {
        let body = self.reply_body(mailbox, thread, message, mode).await?;
        let timeout = self.deps.config.gateway_timeout;
        let account = mailbox.provider_account.as_str();

        if send {
            let target = ThreadStatus::AwaitingCustomerReply;
            if !thread.status.can_transition_to(target) {
                return Err(PipelineError::InvalidTransition {
                    from: thread.status.to_string(),
                    to: target.to_string(),
                }
                .into());
            }
            with_timeout(
                "mail",
                timeout,
                self.deps
                    .mail
                    .send_reply(account, &message.provider_message_id, &body),
            )
            .await?;
            thread.record_outbound_sent(ctx.now)?;
            let outbound = Message::outbound(
                message,
                format!("sent-{}", Uuid::new_v4()),
                &mailbox.address,
                body,
                MessageStatus::Sent,
                ctx.now,
            )
            .with_rule(Some(rule.id));
            if let Err(e) = self.deps.store.insert_message(&outbound).await {
                warn!(thread = %thread.id, error = %e, "Reply sent but not recorded");
            }
            Ok(ActionEffect::Sent {
                message_id: outbound.id,
            })
        } else {
            let draft = with_timeout(
                "mail",
                timeout,
                self.deps
                    .mail
                    .create_reply_draft(account, &message.provider_message_id, &body),
            )
            .await?;
            let outbound = Message::outbound(
                message,
                draft.id,
                &mailbox.address,
                body,
                MessageStatus::DraftCreated,
                ctx.now,
            )
            .with_rule(Some(rule.id));
            self.deps.store.insert_message(&outbound).await?;
            thread.transition_to(ThreadStatus::DraftPending, ctx.now)?;
            Ok(ActionEffect::Drafted {
                message_id: outbound.id,
            })
        }
    }

    async fn reply_body(
        &self,
        mailbox: &Mailbox,
        thread: &Thread,
        message: &Message,
        mode: &ReplyMode,
    ) -> Result<String, Error> {
        match mode {
            ReplyMode::Template { text } if !text.trim().is_empty() => {
                Ok(render_template(text, mailbox, thread))
            }
            ReplyMode::Template { .. } => Ok(DEFAULT_REPLY.to_string()),
            ReplyMode::AiGenerated { instructions } => {
                let mut context = reply_context(mailbox, thread, message);
                context.instructions = instructions.clone();
                let body = with_timeout(
                    "classifier",
                    self.deps.config.gateway_timeout,
                    self.deps.classifier.generate_reply(&context),
                )
                .await?;
                Ok(body)
            }
        }
    }

    async fn create_task(
        &self,
        ctx: &RunContext,
        thread: &mut Thread,
        rule: &AutoReplyRule,
        title: Option<&str>,
    ) -> Result<ActionEffect, Error> {
        let due = match rule.follow_up_after_hours {
            Some(hours) => ctx.now + Duration::hours(i64::from(hours)),
            None => ctx.now + self.deps.config.default_task_due,
        };
        let title = title
            .map(str::to_string)
            .unwrap_or_else(|| format!("Follow up: {}", thread.subject));
        let task = Task::new(thread.id, TaskType::FollowUp, title, due, ctx.now)
            .with_description(format!("Created by rule '{}'", rule.name))
            .with_priority(thread.priority)
            .with_assignee(thread.assigned_to.clone());
        self.deps.store.insert_task(&task).await?;
        thread.transition_to(ThreadStatus::InProgress, ctx.now)?;
        Ok(ActionEffect::TaskCreated { task_id: task.id })
    }

    async fn schedule_follow_up(
        &self,
        ctx: &RunContext,
        thread: &mut Thread,
        hours: u32,
    ) -> Result<(), Error> {
        let due = ctx.now + Duration::hours(i64::from(hours));
        let registered = self
            .deps
            .jobs
            .schedule_once(
                JobKind::FollowUp {
                    thread_id: thread.id,
                    due_at: due,
                },
                due,
            )
            .await?;
        thread.schedule_follow_up(due, ctx.now)?;
        debug!(thread = %thread.id, due = %due, registered, "Follow-up scheduled");
        Ok(())
    }
}

/// Build the reply-generation context for `thread`, answering `latest`.
pub(crate) fn reply_context(mailbox: &Mailbox, thread: &Thread, latest: &Message) -> ReplyContext {
    ReplyContext {
        mailbox: mailbox.label().to_string(),
        tenant_context: mailbox.tenant_context.clone(),
        subject: thread.subject.clone(),
        sender_address: latest.from_address.clone(),
        sender_name: latest.from_name.clone(),
        latest_body: latest.body.clone(),
        classification: Some(thread.classification),
        instructions: None,
        is_follow_up: false,
        follow_up_count: thread.follow_up_count,
    }
}

/// Fill `{sender_name}`, `{subject}` and `{mailbox}` placeholders.
fn render_template(text: &str, mailbox: &Mailbox, thread: &Thread) -> String {
    let sender = thread
        .from_name
        .as_deref()
        .unwrap_or(thread.from_address.as_str());
    text.replace("{sender_name}", sender)
        .replace("{subject}", &thread.subject)
        .replace("{mailbox}", mailbox.label())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::mailboxes::model::SlaPolicy;
    use crate::pipeline::context::RunKind;
    use crate::testing::{Harness, provider_message};

    async fn fixture(h: &Harness) -> (RunContext, Mailbox, Thread, Message) {
        let ctx = RunContext::new(RunKind::PullSync);
        let mailbox = h.mailbox(|_| {}).await;
        let provider = provider_message("m1", "C1", "Invoice question", ctx.now);
        let mut thread = Thread::new(
            mailbox.id,
            "C1",
            provider.subject.clone(),
            provider.from_address.clone(),
            &mailbox.sla,
            ctx.now,
        );
        thread.begin_classification(ctx.now);
        h.store.insert_thread(&thread).await.unwrap();
        let message = Message::inbound(&provider, mailbox.id, thread.id, ctx.now);
        h.store.insert_message(&message).await.unwrap();
        (ctx, mailbox, thread, message)
    }

    #[tokio::test]
    async fn create_task_defaults_due_and_starts_work() {
        let h = Harness::new().await;
        let (ctx, mailbox, mut thread, message) = fixture(&h).await;
        let rule = AutoReplyRule::new(mailbox.id, "triage", 1, RuleAction::CreateTask { title: None });

        let effect = ActionDispatcher::new(h.deps())
            .dispatch(&ctx, &mailbox, &mut thread, &message, &rule)
            .await
            .unwrap();
        let ActionEffect::TaskCreated { task_id } = effect else {
            panic!("unexpected effect {effect:?}");
        };
        let task = h.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.task_type, TaskType::FollowUp);
        assert_eq!(task.title, "Follow up: Invoice question");
        assert_eq!(
            task.due_at.timestamp(),
            (ctx.now + Duration::hours(24)).timestamp()
        );
        assert_eq!(thread.status, ThreadStatus::InProgress);
    }

    #[tokio::test]
    async fn mark_as_handled_closes_without_follow_up() {
        let h = Harness::new().await;
        let (ctx, mailbox, mut thread, message) = fixture(&h).await;
        let rule =
            AutoReplyRule::new(mailbox.id, "fyi", 1, RuleAction::MarkAsHandled).with_follow_up(24);

        let effect = ActionDispatcher::new(h.deps())
            .dispatch(&ctx, &mailbox, &mut thread, &message, &rule)
            .await
            .unwrap();
        assert_eq!(effect, ActionEffect::Closed);
        assert_eq!(thread.status, ThreadStatus::Closed);
        assert!(thread.next_follow_up_at.is_none());
        let jobs = h
            .store
            .list_due_jobs(ctx.now + Duration::hours(48), 10)
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn ignore_marks_spam() {
        let h = Harness::new().await;
        let (ctx, mailbox, mut thread, message) = fixture(&h).await;
        let rule = AutoReplyRule::new(mailbox.id, "noise", 1, RuleAction::Ignore);

        let effect = ActionDispatcher::new(h.deps())
            .dispatch(&ctx, &mailbox, &mut thread, &message, &rule)
            .await
            .unwrap();
        assert_eq!(effect, ActionEffect::MarkedSpam);
        assert_eq!(thread.status, ThreadStatus::Spam);
        assert!(h.mail.drafts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closed_thread_is_not_replied_to() {
        let h = Harness::new().await;
        let (ctx, mut mailbox, mut thread, message) = fixture(&h).await;
        mailbox.draft_mode_default = false;
        thread.transition_to(ThreadStatus::Closed, ctx.now).unwrap();
        let rule = AutoReplyRule::new(
            mailbox.id,
            "send",
            1,
            RuleAction::SendImmediately {
                reply: ReplyMode::Template { text: "ok".into() },
            },
        );

        let err = ActionDispatcher::new(h.deps())
            .dispatch(&ctx, &mailbox, &mut thread, &message, &rule)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Pipeline(PipelineError::InvalidTransition { .. })
        ));
        assert!(h.mail.sent.lock().unwrap().is_empty());
        assert_eq!(thread.status, ThreadStatus::Closed);
    }

    #[tokio::test]
    async fn ai_reply_carries_rule_instructions() {
        let h = Harness::new().await;
        let (ctx, mailbox, mut thread, message) = fixture(&h).await;
        let rule = AutoReplyRule::new(
            mailbox.id,
            "billing",
            1,
            RuleAction::CreateDraft {
                reply: ReplyMode::AiGenerated {
                    instructions: Some("Point to the billing portal".into()),
                },
            },
        );

        ActionDispatcher::new(h.deps())
            .dispatch(&ctx, &mailbox, &mut thread, &message, &rule)
            .await
            .unwrap();
        let replies = h.classifier.replies.lock().unwrap().clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(
            replies[0].instructions.as_deref(),
            Some("Point to the billing portal")
        );
        assert!(!replies[0].is_follow_up);
        let drafts = h.mail.drafts.lock().unwrap().clone();
        assert_eq!(drafts[0].1, "Generated reply");
        assert_eq!(thread.status, ThreadStatus::DraftPending);
    }

    #[test]
    fn template_placeholders_are_filled() {
        let mailbox = Mailbox::new("support@example.com", "acct");
        let thread = Thread::new(
            mailbox.id,
            "c",
            "Login broken",
            "jane@example.com",
            &SlaPolicy::default(),
            Utc::now(),
        )
        .with_from_name(Some("Jane".into()));
        let text = render_template(
            "Hi {sender_name}, re '{subject}' from {mailbox}.",
            &mailbox,
            &thread,
        );
        assert_eq!(
            text,
            format!("Hi Jane, re 'Login broken' from {}.", mailbox.label())
        );
    }

    #[test]
    fn template_falls_back_to_address() {
        let mailbox = Mailbox::new("support@example.com", "acct");
        let thread = Thread::new(
            mailbox.id,
            "c",
            "s",
            "jane@example.com",
            &SlaPolicy::default(),
            Utc::now(),
        );
        assert_eq!(
            render_template("Hi {sender_name}", &mailbox, &thread),
            "Hi jane@example.com"
        );
    }
}
