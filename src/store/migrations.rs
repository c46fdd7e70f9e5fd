//! Schema for mailboxes, threads, messages, tasks, rules and jobs.
//!
//! Versions are recorded in `_migrations`; only versions above the recorded
//! maximum are applied, in order.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append-only. Never edit a shipped version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS mailboxes (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL UNIQUE,
                display_name TEXT,
                provider_account TEXT NOT NULL,
                tenant_context TEXT,
                sla_first_response_hours INTEGER,
                sla_resolution_hours INTEGER,
                auto_reply_enabled INTEGER NOT NULL DEFAULT 1,
                draft_mode_default INTEGER NOT NULL DEFAULT 1,
                push_enabled INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_sync_at TEXT,
                subscription_id TEXT,
                subscription_expires_at TEXT,
                subscription_client_state TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mailboxes_subscription ON mailboxes(subscription_id);

            CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                mailbox_id TEXT NOT NULL REFERENCES mailboxes(id),
                conversation_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                from_address TEXT NOT NULL,
                from_name TEXT,
                status TEXT NOT NULL,
                classification TEXT NOT NULL,
                confidence INTEGER NOT NULL DEFAULT 0,
                requires_review INTEGER NOT NULL DEFAULT 0,
                classification_reasoning TEXT,
                priority TEXT NOT NULL,
                assigned_to TEXT,
                first_response_deadline TEXT,
                resolution_deadline TEXT,
                first_response_at TEXT,
                resolved_at TEXT,
                first_response_breached INTEGER NOT NULL DEFAULT 0,
                resolution_breached INTEGER NOT NULL DEFAULT 0,
                next_follow_up_at TEXT,
                follow_up_count INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                last_message_at TEXT NOT NULL,
                entities TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (mailbox_id, conversation_id)
            );
            CREATE INDEX IF NOT EXISTS idx_threads_status ON threads(status);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                mailbox_id TEXT NOT NULL,
                provider_message_id TEXT NOT NULL UNIQUE,
                internet_message_id TEXT,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                from_address TEXT NOT NULL,
                from_name TEXT,
                to_addresses TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL,
                body_preview TEXT NOT NULL,
                body TEXT NOT NULL,
                body_is_html INTEGER NOT NULL DEFAULT 0,
                received_at TEXT NOT NULL,
                in_reply_to TEXT,
                rule_id TEXT,
                approved_by TEXT,
                sent_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, received_at);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                task_type TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                priority TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                due_at TEXT NOT NULL,
                assigned_to TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_thread ON tasks(thread_id);

            CREATE TABLE IF NOT EXISTS auto_reply_rules (
                id TEXT PRIMARY KEY,
                mailbox_id TEXT NOT NULL REFERENCES mailboxes(id),
                name TEXT NOT NULL,
                priority INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                triggers TEXT NOT NULL,
                action TEXT NOT NULL,
                follow_up_after_hours INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rules_mailbox ON auto_reply_rules(mailbox_id, priority);
        "#,
    },
    Migration {
        version: 2,
        name: "scheduled_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                fire_at TEXT NOT NULL,
                dedup_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                claimed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON scheduled_jobs(status, fire_at);
        "#,
    },
    Migration {
        version: 3,
        name: "mailbox_sync_lease",
        sql: r#"
            ALTER TABLE mailboxes ADD COLUMN sync_lease_holder TEXT;
            ALTER TABLE mailboxes ADD COLUMN sync_lease_until TEXT;
        "#,
    },
];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "mailboxes",
            "threads",
            "messages",
            "tasks",
            "auto_reply_rules",
            "scheduled_jobs",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[tokio::test]
    async fn lease_columns_exist_after_migration() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.query(
            "SELECT sync_lease_holder, sync_lease_until FROM mailboxes",
            (),
        )
        .await
        .unwrap();
    }
}
