//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 (microseconds, `Z`) so text comparison in SQL orders
//! them correctly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::mailboxes::model::{Mailbox, SlaPolicy, Subscription};
use crate::pipeline::rules::{AutoReplyRule, RuleAction, RuleTriggers};
use crate::pipeline::types::{Message, MessageDirection, MessageStatus};
use crate::scheduler::jobs::{JobKind, JobStatus, ScheduledJob};
use crate::sla::BreachKind;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::model::{Task, TaskStatus, TaskType};
use crate::threads::model::{Classification, Priority, Thread};
use crate::threads::state::ThreadStatus;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a raw statement. Tests use it to break tables mid-flow.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("execute_raw: {e}")))?;
        Ok(())
    }
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

fn parse_enum<T>(s: &str, what: &str, parse: fn(&str) -> Option<T>) -> Result<T, DatabaseError> {
    parse(s).ok_or_else(|| DatabaseError::Serialization(format!("unknown {what}: {s}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<u32>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(i64::from(n)),
        None => libsql::Value::Null,
    }
}

fn opt_u32(row: &libsql::Row, idx: i32) -> Option<u32> {
    row.get::<i64>(idx).ok().and_then(|n| u32::try_from(n).ok())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Drain a result set through a row mapper.
async fn collect<T>(
    mut rows: libsql::Rows,
    ctx: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?
    {
        out.push(map(&row)?);
    }
    Ok(out)
}

async fn first<T>(
    rows: libsql::Rows,
    ctx: &str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    Ok(collect(rows, ctx, map).await?.into_iter().next())
}

// ── Row mappers ─────────────────────────────────────────────────────

const MAILBOX_COLUMNS: &str = "id, address, display_name, provider_account, tenant_context, \
    sla_first_response_hours, sla_resolution_hours, auto_reply_enabled, draft_mode_default, \
    push_enabled, is_active, last_sync_at, subscription_id, subscription_expires_at, \
    subscription_client_state, created_at, updated_at";

fn row_to_mailbox(row: &libsql::Row) -> Result<Mailbox, DatabaseError> {
    let id: String = row.get(0)?;
    let subscription = match (
        row.get::<String>(12).ok(),
        row.get::<String>(13).ok(),
        row.get::<String>(14).ok(),
    ) {
        (Some(id), Some(expires), Some(client_state)) => Some(Subscription {
            id,
            expires_at: parse_datetime(&expires),
            client_state,
        }),
        _ => None,
    };

    Ok(Mailbox {
        id: parse_uuid(&id)?,
        address: row.get(1)?,
        display_name: row.get::<String>(2).ok(),
        provider_account: row.get(3)?,
        tenant_context: row.get::<String>(4).ok(),
        sla: SlaPolicy {
            first_response_hours: opt_u32(row, 5),
            resolution_hours: opt_u32(row, 6),
        },
        auto_reply_enabled: row.get::<i64>(7)? != 0,
        draft_mode_default: row.get::<i64>(8)? != 0,
        push_enabled: row.get::<i64>(9)? != 0,
        is_active: row.get::<i64>(10)? != 0,
        last_sync_at: parse_optional_datetime(row.get::<String>(11).ok()),
        subscription,
        created_at: parse_datetime(&row.get::<String>(15)?),
        updated_at: parse_datetime(&row.get::<String>(16)?),
    })
}

const THREAD_COLUMNS: &str = "id, mailbox_id, conversation_id, subject, from_address, from_name, \
    status, classification, confidence, requires_review, classification_reasoning, priority, \
    assigned_to, first_response_deadline, resolution_deadline, first_response_at, resolved_at, \
    first_response_breached, resolution_breached, next_follow_up_at, follow_up_count, \
    message_count, last_message_at, entities, created_at, updated_at";

fn row_to_thread(row: &libsql::Row) -> Result<Thread, DatabaseError> {
    let id: String = row.get(0)?;
    let mailbox_id: String = row.get(1)?;
    let status: String = row.get(6)?;
    let classification: String = row.get(7)?;
    let priority: String = row.get(11)?;
    let entities = match row.get::<String>(23).ok() {
        Some(s) => Some(from_json(&s)?),
        None => None,
    };

    Ok(Thread {
        id: parse_uuid(&id)?,
        mailbox_id: parse_uuid(&mailbox_id)?,
        conversation_id: row.get(2)?,
        subject: row.get(3)?,
        from_address: row.get(4)?,
        from_name: row.get::<String>(5).ok(),
        status: parse_enum(&status, "thread status", ThreadStatus::from_db)?,
        classification: Classification::from_label(&classification),
        confidence: u8::try_from(row.get::<i64>(8)?.clamp(0, 100)).unwrap_or(0),
        requires_review: row.get::<i64>(9)? != 0,
        classification_reasoning: row.get::<String>(10).ok(),
        priority: Priority::from_label(&priority),
        assigned_to: row.get::<String>(12).ok(),
        first_response_deadline: parse_optional_datetime(row.get::<String>(13).ok()),
        resolution_deadline: parse_optional_datetime(row.get::<String>(14).ok()),
        first_response_at: parse_optional_datetime(row.get::<String>(15).ok()),
        resolved_at: parse_optional_datetime(row.get::<String>(16).ok()),
        first_response_breached: row.get::<i64>(17)? != 0,
        resolution_breached: row.get::<i64>(18)? != 0,
        next_follow_up_at: parse_optional_datetime(row.get::<String>(19).ok()),
        follow_up_count: opt_u32(row, 20).unwrap_or(0),
        message_count: opt_u32(row, 21).unwrap_or(0),
        last_message_at: parse_datetime(&row.get::<String>(22)?),
        entities,
        created_at: parse_datetime(&row.get::<String>(24)?),
        updated_at: parse_datetime(&row.get::<String>(25)?),
    })
}

const MESSAGE_COLUMNS: &str = "id, thread_id, mailbox_id, provider_message_id, \
    internet_message_id, direction, status, from_address, from_name, to_addresses, subject, \
    body_preview, body, body_is_html, received_at, in_reply_to, rule_id, approved_by, sent_at, \
    created_at";

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let mailbox_id: String = row.get(2)?;
    let direction: String = row.get(5)?;
    let status: String = row.get(6)?;
    let to: String = row.get(9)?;
    let rule_id = match row.get::<String>(16).ok() {
        Some(s) => Some(parse_uuid(&s)?),
        None => None,
    };

    Ok(Message {
        id: parse_uuid(&id)?,
        thread_id: parse_uuid(&thread_id)?,
        mailbox_id: parse_uuid(&mailbox_id)?,
        provider_message_id: row.get(3)?,
        internet_message_id: row.get::<String>(4).ok(),
        direction: parse_enum(&direction, "message direction", MessageDirection::from_db)?,
        status: parse_enum(&status, "message status", MessageStatus::from_db)?,
        from_address: row.get(7)?,
        from_name: row.get::<String>(8).ok(),
        to_addresses: from_json(&to)?,
        subject: row.get(10)?,
        body_preview: row.get(11)?,
        body: row.get(12)?,
        body_is_html: row.get::<i64>(13)? != 0,
        received_at: parse_datetime(&row.get::<String>(14)?),
        in_reply_to: row.get::<String>(15).ok(),
        rule_id,
        approved_by: row.get::<String>(17).ok(),
        sent_at: parse_optional_datetime(row.get::<String>(18).ok()),
        created_at: parse_datetime(&row.get::<String>(19)?),
    })
}

const TASK_COLUMNS: &str = "id, thread_id, task_type, title, description, priority, status, \
    due_at, assigned_to, completed_at, created_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let task_type: String = row.get(2)?;
    let priority: String = row.get(5)?;
    let status: String = row.get(6)?;

    Ok(Task {
        id: parse_uuid(&id)?,
        thread_id: parse_uuid(&thread_id)?,
        task_type: parse_enum(&task_type, "task type", TaskType::from_db)?,
        title: row.get(3)?,
        description: row.get::<String>(4).ok(),
        priority: Priority::from_label(&priority),
        status: parse_enum(&status, "task status", TaskStatus::from_db)?,
        due_at: parse_datetime(&row.get::<String>(7)?),
        assigned_to: row.get::<String>(8).ok(),
        completed_at: parse_optional_datetime(row.get::<String>(9).ok()),
        created_at: parse_datetime(&row.get::<String>(10)?),
    })
}

const RULE_COLUMNS: &str =
    "id, mailbox_id, name, priority, is_active, triggers, action, follow_up_after_hours, created_at";

fn row_to_rule(row: &libsql::Row) -> Result<AutoReplyRule, DatabaseError> {
    let id: String = row.get(0)?;
    let mailbox_id: String = row.get(1)?;
    let triggers: String = row.get(5)?;
    let action: String = row.get(6)?;

    Ok(AutoReplyRule {
        id: parse_uuid(&id)?,
        mailbox_id: parse_uuid(&mailbox_id)?,
        name: row.get(2)?,
        priority: i32::try_from(row.get::<i64>(3)?)
            .map_err(|e| DatabaseError::Serialization(format!("rule priority: {e}")))?,
        is_active: row.get::<i64>(4)? != 0,
        triggers: from_json::<RuleTriggers>(&triggers)?,
        action: from_json::<RuleAction>(&action)?,
        follow_up_after_hours: opt_u32(row, 7),
        created_at: parse_datetime(&row.get::<String>(8)?),
    })
}

const JOB_COLUMNS: &str = "id, kind, fire_at, dedup_key, status, attempts, last_error, created_at";

fn row_to_job(row: &libsql::Row) -> Result<ScheduledJob, DatabaseError> {
    let id: String = row.get(0)?;
    let kind: String = row.get(1)?;
    let status: String = row.get(4)?;

    Ok(ScheduledJob {
        id: parse_uuid(&id)?,
        kind: from_json::<JobKind>(&kind)?,
        fire_at: parse_datetime(&row.get::<String>(2)?),
        dedup_key: row.get(3)?,
        status: parse_enum(&status, "job status", JobStatus::from_db)?,
        attempts: opt_u32(row, 5).unwrap_or(0),
        last_error: row.get::<String>(6).ok(),
        created_at: parse_datetime(&row.get::<String>(7)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn upsert_mailbox(&self, mailbox: &Mailbox) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO mailboxes (id, address, display_name, provider_account, tenant_context, \
                 sla_first_response_hours, sla_resolution_hours, auto_reply_enabled, \
                 draft_mode_default, push_enabled, is_active, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                 ON CONFLICT(id) DO UPDATE SET \
                 address = excluded.address, display_name = excluded.display_name, \
                 provider_account = excluded.provider_account, \
                 tenant_context = excluded.tenant_context, \
                 sla_first_response_hours = excluded.sla_first_response_hours, \
                 sla_resolution_hours = excluded.sla_resolution_hours, \
                 auto_reply_enabled = excluded.auto_reply_enabled, \
                 draft_mode_default = excluded.draft_mode_default, \
                 push_enabled = excluded.push_enabled, is_active = excluded.is_active, \
                 updated_at = excluded.updated_at",
                params![
                    mailbox.id.to_string(),
                    mailbox.address.as_str(),
                    opt_text(mailbox.display_name.as_deref()),
                    mailbox.provider_account.as_str(),
                    opt_text(mailbox.tenant_context.as_deref()),
                    opt_int(mailbox.sla.first_response_hours),
                    opt_int(mailbox.sla.resolution_hours),
                    i64::from(mailbox.auto_reply_enabled),
                    i64::from(mailbox.draft_mode_default),
                    i64::from(mailbox.push_enabled),
                    i64::from(mailbox.is_active),
                    ts(&mailbox.created_at),
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_mailbox: {e}")))?;
        debug!(mailbox = %mailbox.id, address = %mailbox.address, "Mailbox upserted");
        Ok(())
    }

    async fn get_mailbox(&self, id: Uuid) -> Result<Option<Mailbox>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_mailbox: {e}")))?;
        first(rows, "get_mailbox", row_to_mailbox).await
    }

    async fn list_active_mailboxes(&self) -> Result<Vec<Mailbox>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE is_active = 1 ORDER BY address"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_mailboxes: {e}")))?;
        collect(rows, "list_active_mailboxes", row_to_mailbox).await
    }

    async fn find_mailbox_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Mailbox>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE subscription_id = ?1"),
                params![subscription_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_mailbox_by_subscription: {e}")))?;
        first(rows, "find_mailbox_by_subscription", row_to_mailbox).await
    }

    async fn update_sync_watermark(
        &self,
        mailbox_id: Uuid,
        watermark: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET last_sync_at = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND (last_sync_at IS NULL OR last_sync_at < ?2)",
                params![mailbox_id.to_string(), ts(&watermark), ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_sync_watermark: {e}")))?;
        Ok(())
    }

    async fn set_subscription(
        &self,
        mailbox_id: Uuid,
        subscription: Option<&Subscription>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET subscription_id = ?2, subscription_expires_at = ?3, \
                 subscription_client_state = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    mailbox_id.to_string(),
                    opt_text(subscription.map(|s| s.id.as_str())),
                    opt_ts(subscription.map(|s| &s.expires_at)),
                    opt_text(subscription.map(|s| s.client_state.as_str())),
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_subscription: {e}")))?;
        Ok(())
    }

    async fn deactivate_mailbox(&self, mailbox_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                params![mailbox_id.to_string(), ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deactivate_mailbox: {e}")))?;
        info!(mailbox = %mailbox_id, "Mailbox deactivated");
        Ok(())
    }

    async fn try_acquire_sync_lease(
        &self,
        mailbox_id: Uuid,
        holder: Uuid,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE mailboxes SET sync_lease_holder = ?2, sync_lease_until = ?4 \
                 WHERE id = ?1 AND (sync_lease_holder IS NULL OR sync_lease_until IS NULL \
                 OR sync_lease_until <= ?3 OR sync_lease_holder = ?2)",
                params![mailbox_id.to_string(), holder.to_string(), ts(&now), ts(&until)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_acquire_sync_lease: {e}")))?;
        Ok(changed == 1)
    }

    async fn release_sync_lease(
        &self,
        mailbox_id: Uuid,
        holder: Uuid,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET sync_lease_holder = NULL, sync_lease_until = NULL \
                 WHERE id = ?1 AND sync_lease_holder = ?2",
                params![mailbox_id.to_string(), holder.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_sync_lease: {e}")))?;
        Ok(())
    }

    // ── Threads ─────────────────────────────────────────────────────

    async fn insert_thread(&self, thread: &Thread) -> Result<bool, DatabaseError> {
        let entities = match &thread.entities {
            Some(v) => libsql::Value::Text(to_json(v)?),
            None => libsql::Value::Null,
        };
        let changed = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO threads ({THREAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, \
                     ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, \
                     ?23, ?24, ?25, ?26) ON CONFLICT(mailbox_id, conversation_id) DO NOTHING"
                ),
                params![
                    thread.id.to_string(),
                    thread.mailbox_id.to_string(),
                    thread.conversation_id.as_str(),
                    thread.subject.as_str(),
                    thread.from_address.as_str(),
                    opt_text(thread.from_name.as_deref()),
                    thread.status.as_str(),
                    thread.classification.as_str(),
                    i64::from(thread.confidence),
                    i64::from(thread.requires_review),
                    opt_text(thread.classification_reasoning.as_deref()),
                    thread.priority.as_str(),
                    opt_text(thread.assigned_to.as_deref()),
                    opt_ts(thread.first_response_deadline.as_ref()),
                    opt_ts(thread.resolution_deadline.as_ref()),
                    opt_ts(thread.first_response_at.as_ref()),
                    opt_ts(thread.resolved_at.as_ref()),
                    i64::from(thread.first_response_breached),
                    i64::from(thread.resolution_breached),
                    opt_ts(thread.next_follow_up_at.as_ref()),
                    i64::from(thread.follow_up_count),
                    i64::from(thread.message_count),
                    ts(&thread.last_message_at),
                    entities,
                    ts(&thread.created_at),
                    ts(&thread.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_thread: {e}")))?;
        Ok(changed == 1)
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread: {e}")))?;
        first(rows, "get_thread", row_to_thread).await
    }

    async fn find_thread(
        &self,
        mailbox_id: Uuid,
        conversation_id: &str,
    ) -> Result<Option<Thread>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM threads \
                     WHERE mailbox_id = ?1 AND conversation_id = ?2"
                ),
                params![mailbox_id.to_string(), conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_thread: {e}")))?;
        first(rows, "find_thread", row_to_thread).await
    }

    async fn update_thread(&self, thread: &Thread) -> Result<(), DatabaseError> {
        let entities = match &thread.entities {
            Some(v) => libsql::Value::Text(to_json(v)?),
            None => libsql::Value::Null,
        };
        let changed = self
            .conn()
            .execute(
                "UPDATE threads SET subject = ?2, from_name = ?3, status = ?4, \
                 classification = ?5, confidence = ?6, requires_review = ?7, \
                 classification_reasoning = ?8, priority = ?9, assigned_to = ?10, \
                 first_response_at = COALESCE(first_response_at, ?11), resolved_at = ?12, \
                 first_response_breached = MAX(first_response_breached, ?13), \
                 resolution_breached = MAX(resolution_breached, ?14), \
                 next_follow_up_at = ?15, follow_up_count = ?16, message_count = ?17, \
                 last_message_at = ?18, entities = ?19, updated_at = ?20 \
                 WHERE id = ?1",
                params![
                    thread.id.to_string(),
                    thread.subject.as_str(),
                    opt_text(thread.from_name.as_deref()),
                    thread.status.as_str(),
                    thread.classification.as_str(),
                    i64::from(thread.confidence),
                    i64::from(thread.requires_review),
                    opt_text(thread.classification_reasoning.as_deref()),
                    thread.priority.as_str(),
                    opt_text(thread.assigned_to.as_deref()),
                    opt_ts(thread.first_response_at.as_ref()),
                    opt_ts(thread.resolved_at.as_ref()),
                    i64::from(thread.first_response_breached),
                    i64::from(thread.resolution_breached),
                    opt_ts(thread.next_follow_up_at.as_ref()),
                    i64::from(thread.follow_up_count),
                    i64::from(thread.message_count),
                    ts(&thread.last_message_at),
                    entities,
                    ts(&thread.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_thread: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "thread".into(),
                id: thread.id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_sla_candidates(&self) -> Result<Vec<Thread>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM threads \
                     WHERE status NOT IN ('resolved', 'closed', 'spam') AND ( \
                       (first_response_deadline IS NOT NULL AND first_response_breached = 0 \
                        AND first_response_at IS NULL) \
                       OR (resolution_deadline IS NOT NULL AND resolution_breached = 0)) \
                     ORDER BY created_at"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sla_candidates: {e}")))?;
        collect(rows, "list_sla_candidates", row_to_thread).await
    }

    async fn mark_sla_breach(
        &self,
        thread_id: Uuid,
        kind: BreachKind,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let sql = match kind {
            BreachKind::FirstResponse => {
                "UPDATE threads SET first_response_breached = 1, priority = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND first_response_breached = 0"
            }
            BreachKind::Resolution => {
                "UPDATE threads SET resolution_breached = 1, priority = ?2, updated_at = ?3 \
                 WHERE id = ?1 AND resolution_breached = 0"
            }
        };
        let changed = self
            .conn()
            .execute(
                sql,
                params![thread_id.to_string(), priority.as_str(), ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_sla_breach: {e}")))?;
        Ok(changed == 1)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn message_exists(&self, provider_message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM messages WHERE provider_message_id = ?1",
                params![provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("message_exists: {e}")))?;
        let count = match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("message_exists: {e}")))?
        {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(count > 0)
    }

    async fn insert_message(&self, message: &Message) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, \
                     ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20) \
                     ON CONFLICT(provider_message_id) DO NOTHING"
                ),
                params![
                    message.id.to_string(),
                    message.thread_id.to_string(),
                    message.mailbox_id.to_string(),
                    message.provider_message_id.as_str(),
                    opt_text(message.internet_message_id.as_deref()),
                    message.direction.as_str(),
                    message.status.as_str(),
                    message.from_address.as_str(),
                    opt_text(message.from_name.as_deref()),
                    to_json(&message.to_addresses)?,
                    message.subject.as_str(),
                    message.body_preview.as_str(),
                    message.body.as_str(),
                    i64::from(message.body_is_html),
                    ts(&message.received_at),
                    opt_text(message.in_reply_to.as_deref()),
                    opt_text(message.rule_id.map(|id| id.to_string()).as_deref()),
                    opt_text(message.approved_by.as_deref()),
                    opt_ts(message.sent_at.as_ref()),
                    ts(&message.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;
        Ok(changed == 1)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;
        first(rows, "get_message", row_to_message).await
    }

    async fn list_thread_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 \
                     ORDER BY received_at ASC, created_at ASC"
                ),
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_thread_messages: {e}")))?;
        collect(rows, "list_thread_messages", row_to_message).await
    }

    async fn latest_inbound_message(
        &self,
        thread_id: Uuid,
    ) -> Result<Option<Message>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE thread_id = ?1 AND direction = 'inbound' \
                     ORDER BY received_at DESC LIMIT 1"
                ),
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_inbound_message: {e}")))?;
        first(rows, "latest_inbound_message", row_to_message).await
    }

    async fn update_message_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        approved_by: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET status = ?2, approved_by = COALESCE(?3, approved_by), \
                 sent_at = COALESCE(?4, sent_at) WHERE id = ?1",
                params![
                    id.to_string(),
                    status.as_str(),
                    opt_text(approved_by),
                    opt_ts(sent_at.as_ref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_message_status: {e}")))?;
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    task.id.to_string(),
                    task.thread_id.to_string(),
                    task.task_type.as_str(),
                    task.title.as_str(),
                    opt_text(task.description.as_deref()),
                    task.priority.as_str(),
                    task.status.as_str(),
                    ts(&task.due_at),
                    opt_text(task.assigned_to.as_deref()),
                    opt_ts(task.completed_at.as_ref()),
                    ts(&task.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        debug!(task = %task.id, thread = %task.thread_id, kind = task.task_type.as_str(), "Task created");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;
        first(rows, "get_task", row_to_task).await
    }

    async fn list_thread_tasks(&self, thread_id: Uuid) -> Result<Vec<Task>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE thread_id = ?1 ORDER BY created_at"
                ),
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_thread_tasks: {e}")))?;
        collect(rows, "list_thread_tasks", row_to_task).await
    }

    async fn complete_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?2 \
                 WHERE id = ?1 AND status != 'completed'",
                params![id.to_string(), ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;
        Ok(changed == 1)
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn upsert_rule(&self, rule: &AutoReplyRule) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO auto_reply_rules ({RULE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(id) DO UPDATE SET mailbox_id = excluded.mailbox_id, \
                     name = excluded.name, priority = excluded.priority, \
                     is_active = excluded.is_active, triggers = excluded.triggers, \
                     action = excluded.action, \
                     follow_up_after_hours = excluded.follow_up_after_hours"
                ),
                params![
                    rule.id.to_string(),
                    rule.mailbox_id.to_string(),
                    rule.name.as_str(),
                    i64::from(rule.priority),
                    i64::from(rule.is_active),
                    to_json(&rule.triggers)?,
                    to_json(&rule.action)?,
                    opt_int(rule.follow_up_after_hours),
                    ts(&rule.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_rule: {e}")))?;
        Ok(())
    }

    async fn list_active_rules(
        &self,
        mailbox_id: Uuid,
    ) -> Result<Vec<AutoReplyRule>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM auto_reply_rules \
                     WHERE mailbox_id = ?1 AND is_active = 1 \
                     ORDER BY priority ASC, created_at ASC, id ASC"
                ),
                params![mailbox_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_rules: {e}")))?;
        collect(rows, "list_active_rules", row_to_rule).await
    }

    // ── Scheduled jobs ──────────────────────────────────────────────

    async fn enqueue_job(&self, job: &ScheduledJob) -> Result<bool, DatabaseError> {
        let now = ts(&Utc::now());
        let changed = self
            .conn()
            .execute(
                "INSERT INTO scheduled_jobs (id, kind, fire_at, dedup_key, status, attempts, \
                 last_error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(dedup_key) DO NOTHING",
                params![
                    job.id.to_string(),
                    to_json(&job.kind)?,
                    ts(&job.fire_at),
                    job.dedup_key.as_str(),
                    job.status.as_str(),
                    i64::from(job.attempts),
                    opt_text(job.last_error.as_deref()),
                    ts(&job.created_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_job: {e}")))?;
        Ok(changed == 1)
    }

    async fn enqueue_or_rearm_job(&self, job: &ScheduledJob) -> Result<bool, DatabaseError> {
        let now = ts(&Utc::now());
        let changed = self
            .conn()
            .execute(
                "INSERT INTO scheduled_jobs (id, kind, fire_at, dedup_key, status, attempts, \
                 last_error, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(dedup_key) DO UPDATE SET status = 'pending', \
                 fire_at = excluded.fire_at, attempts = 0, last_error = NULL, \
                 claimed_at = NULL, updated_at = excluded.updated_at \
                 WHERE scheduled_jobs.status IN ('completed', 'failed')",
                params![
                    job.id.to_string(),
                    to_json(&job.kind)?,
                    ts(&job.fire_at),
                    job.dedup_key.as_str(),
                    job.status.as_str(),
                    i64::from(job.attempts),
                    opt_text(job.last_error.as_deref()),
                    ts(&job.created_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_or_rearm_job: {e}")))?;
        Ok(changed == 1)
    }

    async fn get_job_by_key(
        &self,
        dedup_key: &str,
    ) -> Result<Option<ScheduledJob>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE dedup_key = ?1"),
                params![dedup_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_by_key: {e}")))?;
        first(rows, "get_job_by_key", row_to_job).await
    }

    async fn list_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM scheduled_jobs \
                     WHERE status = 'pending' AND fire_at <= ?1 \
                     ORDER BY fire_at ASC LIMIT ?2"
                ),
                params![ts(&now), i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_jobs: {e}")))?;
        collect(rows, "list_due_jobs", row_to_job).await
    }

    async fn claim_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE scheduled_jobs SET status = 'running', claimed_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_job: {e}")))?;
        Ok(changed == 1)
    }

    async fn complete_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE scheduled_jobs SET status = 'completed', updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), ts(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;
        Ok(())
    }

    async fn reschedule_job(
        &self,
        id: Uuid,
        fire_at: DateTime<Utc>,
        attempts: u32,
        error: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE scheduled_jobs SET status = 'pending', fire_at = ?2, attempts = ?3, \
                 last_error = ?4, claimed_at = NULL, updated_at = ?5 WHERE id = ?1",
                params![
                    id.to_string(),
                    ts(&fire_at),
                    i64::from(attempts),
                    error,
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_job: {e}")))?;
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, attempts: u32, error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE scheduled_jobs SET status = 'failed', attempts = ?2, last_error = ?3, \
                 updated_at = ?4 WHERE id = ?1",
                params![id.to_string(), i64::from(attempts), error, ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_job: {e}")))?;
        Ok(())
    }

    async fn requeue_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE scheduled_jobs SET status = 'pending', claimed_at = NULL, updated_at = ?1 \
                 WHERE status = 'running' AND claimed_at < ?1",
                params![ts(&stale_before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_stale_jobs: {e}")))
    }
}
