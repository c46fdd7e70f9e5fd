//! Human-driven thread operations.
//!
//! Every operation loads the thread, validates the move against the state
//! machine, talks to the mail gateway if it has to, and persists the result.

use tracing::info;
use uuid::Uuid;

use crate::error::{Error, PipelineError};
use crate::gateways::with_timeout;
use crate::mailboxes::model::Mailbox;
use crate::pipeline::context::{PipelineDeps, RunContext};
use crate::pipeline::types::{Message, MessageStatus};
use crate::threads::model::Thread;
use crate::threads::state::ThreadStatus;

pub struct ThreadService {
    deps: PipelineDeps,
}

impl ThreadService {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    async fn load(&self, thread_id: Uuid) -> Result<Thread, Error> {
        Ok(self
            .deps
            .store
            .get_thread(thread_id)
            .await?
            .ok_or(PipelineError::ThreadNotFound(thread_id))?)
    }

    async fn mailbox(&self, thread: &Thread) -> Result<Mailbox, Error> {
        Ok(self
            .deps
            .store
            .get_mailbox(thread.mailbox_id)
            .await?
            .ok_or(PipelineError::MailboxNotFound(thread.mailbox_id))?)
    }

    async fn transition(
        &self,
        ctx: &RunContext,
        thread_id: Uuid,
        target: ThreadStatus,
    ) -> Result<Thread, Error> {
        let mut thread = self.load(thread_id).await?;
        thread.transition_to(target, ctx.now)?;
        self.deps.store.update_thread(&thread).await?;
        info!(thread = %thread.id, status = %thread.status, "Thread updated");
        Ok(thread)
    }

    pub async fn assign(
        &self,
        ctx: &RunContext,
        thread_id: Uuid,
        assignee: &str,
    ) -> Result<Thread, Error> {
        let mut thread = self.load(thread_id).await?;
        thread.assign(assignee, ctx.now)?;
        self.deps.store.update_thread(&thread).await?;
        info!(thread = %thread.id, assignee, "Thread assigned");
        Ok(thread)
    }

    pub async fn start_work(&self, ctx: &RunContext, thread_id: Uuid) -> Result<Thread, Error> {
        self.transition(ctx, thread_id, ThreadStatus::InProgress)
            .await
    }

    pub async fn resolve(&self, ctx: &RunContext, thread_id: Uuid) -> Result<Thread, Error> {
        self.transition(ctx, thread_id, ThreadStatus::Resolved)
            .await
    }

    pub async fn close(&self, ctx: &RunContext, thread_id: Uuid) -> Result<Thread, Error> {
        self.transition(ctx, thread_id, ThreadStatus::Closed).await
    }

    /// Send a stored reply draft after human approval.
    pub async fn send_draft(
        &self,
        ctx: &RunContext,
        message_id: Uuid,
        approved_by: &str,
    ) -> Result<Thread, Error> {
        let draft = self
            .deps
            .store
            .get_message(message_id)
            .await?
            .ok_or(PipelineError::MessageNotFound(message_id))?;
        if !draft.is_draft() {
            return Err(PipelineError::NotADraft(message_id).into());
        }
        let mut thread = self.load(draft.thread_id).await?;
        if !thread.status.can_transition_to(ThreadStatus::AwaitingCustomerReply) {
            return Err(PipelineError::InvalidTransition {
                from: thread.status.to_string(),
                to: ThreadStatus::AwaitingCustomerReply.to_string(),
            }
            .into());
        }
        let mailbox = self.mailbox(&thread).await?;

        with_timeout(
            "mail",
            self.deps.config.gateway_timeout,
            self.deps
                .mail
                .send_draft(&mailbox.provider_account, &draft.provider_message_id),
        )
        .await?;
        self.deps
            .store
            .update_message_status(draft.id, MessageStatus::Sent, Some(approved_by), Some(ctx.now))
            .await?;
        thread.record_outbound_sent(ctx.now)?;
        self.deps.store.update_thread(&thread).await?;

        info!(thread = %thread.id, message = %draft.id, approved_by, "Draft sent");
        Ok(thread)
    }

    /// Reply to the latest inbound message without going through a draft.
    pub async fn reply_directly(
        &self,
        ctx: &RunContext,
        thread_id: Uuid,
        body: &str,
        author: &str,
    ) -> Result<Thread, Error> {
        let mut thread = self.load(thread_id).await?;
        if !thread.status.can_transition_to(ThreadStatus::AwaitingCustomerReply) {
            return Err(PipelineError::InvalidTransition {
                from: thread.status.to_string(),
                to: ThreadStatus::AwaitingCustomerReply.to_string(),
            }
            .into());
        }
        let mailbox = self.mailbox(&thread).await?;
        let latest = self
            .deps
            .store
            .latest_inbound_message(thread_id)
            .await?
            .ok_or(PipelineError::ThreadNotFound(thread_id))?;

        with_timeout(
            "mail",
            self.deps.config.gateway_timeout,
            self.deps
                .mail
                .send_reply(&mailbox.provider_account, &latest.provider_message_id, body),
        )
        .await?;
        let mut outbound = Message::outbound(
            &latest,
            format!("sent-{}", Uuid::new_v4()),
            &mailbox.address,
            body,
            MessageStatus::Sent,
            ctx.now,
        );
        outbound.approved_by = Some(author.to_string());
        self.deps.store.insert_message(&outbound).await?;
        thread.record_outbound_sent(ctx.now)?;
        self.deps.store.update_thread(&thread).await?;

        info!(thread = %thread.id, author, "Direct reply sent");
        Ok(thread)
    }

    /// Complete a task. Returns `false` if it was already completed.
    pub async fn complete_task(&self, ctx: &RunContext, task_id: Uuid) -> Result<bool, Error> {
        if self.deps.store.get_task(task_id).await?.is_none() {
            return Err(PipelineError::TaskNotFound(task_id).into());
        }
        let completed = self.deps.store.complete_task(task_id, ctx.now).await?;
        info!(task = %task_id, completed, "Task completion recorded");
        Ok(completed)
    }
}
