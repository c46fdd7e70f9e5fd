//! Webhook subscription lifecycle.
//!
//! A subscription is created with a fixed lifetime and a renewal job is
//! registered `renewal_lead` before it expires. A renewal that fires after
//! expiry, or that the provider rejects as unknown, re-subscribes instead and
//! queues a catch-up sync: notifications sent during the gap are lost.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, GatewayError};
use crate::gateways::with_timeout;
use crate::mailboxes::model::{Mailbox, Subscription};
use crate::pipeline::context::{PipelineDeps, RunContext};
use crate::scheduler::jobs::JobKind;

/// Subscription timing.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Public URL the provider posts notifications to. Push is off when unset.
    pub notification_url: Option<String>,
    pub lifetime: Duration,
    pub renewal_lead: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            notification_url: None,
            lifetime: Duration::minutes(4230),
            renewal_lead: Duration::hours(2),
        }
    }
}

/// What a lifecycle call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubscriptionOutcome {
    /// Live subscription, renewal already registered.
    Active,
    Created { subscription_id: String },
    Renewed { expires_at: DateTime<Utc> },
    /// The old subscription was dead and has been replaced.
    Recreated { subscription_id: String },
    /// Push was disabled for the mailbox and its subscription deleted.
    Removed,
    /// Nothing to do: the job refers to a replaced subscription or a
    /// mailbox that no longer uses push.
    Stale,
}

/// Counts for one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub changed: usize,
    pub errors: Vec<(Uuid, String)>,
}

pub struct SubscriptionManager {
    deps: PipelineDeps,
    config: SubscriptionConfig,
}

impl SubscriptionManager {
    pub fn new(deps: PipelineDeps, config: SubscriptionConfig) -> Self {
        Self { deps, config }
    }

    fn push_target<'a>(&'a self, mailbox: &Mailbox) -> Option<&'a str> {
        if !mailbox.is_active || !mailbox.push_enabled || mailbox.provider_account.is_empty() {
            return None;
        }
        self.config.notification_url.as_deref()
    }

    /// Make sure `mailbox` has a live subscription with a renewal registered,
    /// or none at all if push is off.
    pub async fn ensure(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
    ) -> Result<SubscriptionOutcome, Error> {
        let Some(url) = self.push_target(mailbox) else {
            return self.remove(mailbox).await;
        };

        match &mailbox.subscription {
            None => {
                let created = self.create(ctx, mailbox, url).await?;
                Ok(SubscriptionOutcome::Created {
                    subscription_id: created.id,
                })
            }
            Some(existing) if existing.is_expired(ctx.now) => {
                self.recreate(ctx, mailbox, existing, url).await
            }
            Some(existing) if existing.expires_at - self.config.renewal_lead <= ctx.now => {
                self.renew_existing(ctx, mailbox, existing, url).await
            }
            Some(existing) => {
                self.schedule_renewal(ctx, mailbox.id, existing).await?;
                Ok(SubscriptionOutcome::Active)
            }
        }
    }

    /// Renewal job handler.
    pub async fn renew(
        &self,
        ctx: &RunContext,
        mailbox_id: Uuid,
        subscription_id: &str,
    ) -> Result<SubscriptionOutcome, Error> {
        let Some(mailbox) = self.deps.store.get_mailbox(mailbox_id).await? else {
            return Ok(SubscriptionOutcome::Stale);
        };
        let Some(url) = self.push_target(&mailbox) else {
            return Ok(SubscriptionOutcome::Stale);
        };
        let Some(current) = mailbox.subscription.as_ref() else {
            return Ok(SubscriptionOutcome::Stale);
        };
        if current.id != subscription_id {
            info!(
                mailbox = %mailbox.id,
                job_subscription = subscription_id,
                current = %current.id,
                "Renewal for replaced subscription ignored"
            );
            return Ok(SubscriptionOutcome::Stale);
        }

        if current.is_expired(ctx.now) {
            warn!(
                mailbox = %mailbox.id,
                subscription = %current.id,
                expired_at = %current.expires_at,
                "Renewal missed, re-subscribing"
            );
            return self.recreate(ctx, &mailbox, current, url).await;
        }
        self.renew_existing(ctx, &mailbox, current, url).await
    }

    /// Check every active mailbox.
    pub async fn sweep(&self, ctx: &RunContext) -> Result<SweepReport, Error> {
        let mailboxes = self.deps.store.list_active_mailboxes().await?;
        let mut report = SweepReport::default();
        for mailbox in &mailboxes {
            if !mailbox.push_enabled && mailbox.subscription.is_none() {
                continue;
            }
            report.checked += 1;
            match self.ensure(ctx, mailbox).await {
                Ok(SubscriptionOutcome::Active) => {}
                Ok(_) => report.changed += 1,
                Err(e) => {
                    warn!(mailbox = %mailbox.id, error = %e, "Subscription check failed");
                    report.errors.push((mailbox.id, e.to_string()));
                }
            }
        }
        info!(
            checked = report.checked,
            changed = report.changed,
            errors = report.errors.len(),
            "Subscription sweep complete"
        );
        Ok(report)
    }

    async fn renew_existing(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        current: &Subscription,
        url: &str,
    ) -> Result<SubscriptionOutcome, Error> {
        let requested = ctx.now + self.config.lifetime;
        let renewed = with_timeout(
            "mail",
            self.deps.config.gateway_timeout,
            self.deps.mail.renew_subscription(&current.id, requested),
        )
        .await;

        match renewed {
            Ok(expires_at) => {
                let updated = Subscription {
                    expires_at,
                    ..current.clone()
                };
                self.deps
                    .store
                    .set_subscription(mailbox.id, Some(&updated))
                    .await?;
                self.schedule_renewal(ctx, mailbox.id, &updated).await?;
                info!(mailbox = %mailbox.id, subscription = %updated.id, expires_at = %expires_at, "Subscription renewed");
                Ok(SubscriptionOutcome::Renewed { expires_at })
            }
            Err(e) if e.is_not_found() => {
                warn!(mailbox = %mailbox.id, subscription = %current.id, "Provider lost subscription, re-subscribing");
                self.recreate(ctx, mailbox, current, url).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recreate(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        old: &Subscription,
        url: &str,
    ) -> Result<SubscriptionOutcome, Error> {
        self.delete_quietly(mailbox, old).await;
        let created = self.create(ctx, mailbox, url).await?;

        // Catch up on whatever arrived while there was no subscription.
        self.deps
            .jobs
            .schedule_once(
                JobKind::SyncMailbox {
                    mailbox_id: mailbox.id,
                },
                ctx.now,
            )
            .await?;
        Ok(SubscriptionOutcome::Recreated {
            subscription_id: created.id,
        })
    }

    async fn create(
        &self,
        ctx: &RunContext,
        mailbox: &Mailbox,
        url: &str,
    ) -> Result<Subscription, Error> {
        let subscription = with_timeout(
            "mail",
            self.deps.config.gateway_timeout,
            self.deps.mail.create_subscription(
                &mailbox.provider_account,
                url,
                ctx.now + self.config.lifetime,
            ),
        )
        .await?;
        self.deps
            .store
            .set_subscription(mailbox.id, Some(&subscription))
            .await?;
        self.schedule_renewal(ctx, mailbox.id, &subscription).await?;
        info!(
            mailbox = %mailbox.id,
            subscription = %subscription.id,
            expires_at = %subscription.expires_at,
            "Subscription created"
        );
        Ok(subscription)
    }

    async fn remove(&self, mailbox: &Mailbox) -> Result<SubscriptionOutcome, Error> {
        let Some(existing) = &mailbox.subscription else {
            return Ok(SubscriptionOutcome::Stale);
        };
        self.delete_quietly(mailbox, existing).await;
        self.deps.store.set_subscription(mailbox.id, None).await?;
        info!(mailbox = %mailbox.id, subscription = %existing.id, "Subscription removed");
        Ok(SubscriptionOutcome::Removed)
    }

    async fn delete_quietly(&self, mailbox: &Mailbox, subscription: &Subscription) {
        let deleted = with_timeout(
            "mail",
            self.deps.config.gateway_timeout,
            self.deps.mail.delete_subscription(&subscription.id),
        )
        .await;
        match deleted {
            Ok(()) | Err(GatewayError::NotFound { .. }) => {}
            Err(e) => {
                warn!(mailbox = %mailbox.id, subscription = %subscription.id, error = %e, "Subscription delete failed")
            }
        }
    }

    async fn schedule_renewal(
        &self,
        ctx: &RunContext,
        mailbox_id: Uuid,
        subscription: &Subscription,
    ) -> Result<(), Error> {
        let fire_at = (subscription.expires_at - self.config.renewal_lead).max(ctx.now);
        self.deps
            .jobs
            .schedule_once(
                JobKind::RenewSubscription {
                    mailbox_id,
                    subscription_id: subscription.id.clone(),
                },
                fire_at,
            )
            .await?;
        Ok(())
    }
}
