//! Schema migrations.
//!
//! Versions are recorded in `_schema_versions`. Each pending migration runs
//! in its own transaction together with its version row.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; versions must increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS parse_results (
                attachment_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                document_type TEXT,
                classification_confidence REAL,
                extracted_fields TEXT NOT NULL DEFAULT '{}',
                field_confidence TEXT NOT NULL DEFAULT '{}',
                low_confidence_fields TEXT NOT NULL DEFAULT '[]',
                error TEXT,
                model TEXT,
                file_sha256 TEXT,
                ingestion_key TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_parse_results_status ON parse_results(status);
            CREATE INDEX IF NOT EXISTS idx_parse_results_ingestion ON parse_results(ingestion_key);

            CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL DEFAULT '',
                capabilities TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                trigger_type TEXT NOT NULL,
                trigger_filters TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workflows_tenant ON workflows(tenant_id, trigger_type);

            CREATE TABLE IF NOT EXISTS workflow_steps (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL REFERENCES workflows(id),
                step_order INTEGER NOT NULL DEFAULT 0,
                kind TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                next_on_success TEXT,
                next_on_failure TEXT,
                is_enabled INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_workflow_steps_workflow ON workflow_steps(workflow_id);
        "#,
    },
    Migration {
        version: 2,
        name: "submission_tracking",
        sql: r#"
            CREATE TABLE IF NOT EXISTS submissions (
                id TEXT PRIMARY KEY,
                ingestion_key TEXT NOT NULL,
                attachment_id TEXT NOT NULL,
                workflow_id TEXT,
                step_id TEXT,
                document_type TEXT NOT NULL,
                target_url TEXT NOT NULL,
                target TEXT NOT NULL,
                extracted_fields TEXT NOT NULL DEFAULT '{}',
                submission_status TEXT NOT NULL DEFAULT 'pending',
                http_status INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                next_retry_at TEXT,
                retry_delay_seconds INTEGER,
                manual_payload_override TEXT,
                partner_response TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_submissions_dedup
                ON submissions(ingestion_key, document_type, target_url);
            CREATE INDEX IF NOT EXISTS idx_submissions_retry
                ON submissions(submission_status, next_retry_at);

            CREATE TABLE IF NOT EXISTS submission_attempts (
                id TEXT PRIMARY KEY,
                submission_id TEXT NOT NULL REFERENCES submissions(id),
                attempt_number INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                http_status INTEGER,
                error TEXT,
                used_override INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_submission_attempts_submission
                ON submission_attempts(submission_id);
        "#,
    },
    Migration {
        version: 3,
        name: "workflow_executions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                attachment_id TEXT NOT NULL,
                ingestion_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                visited_steps TEXT NOT NULL DEFAULT '[]',
                context TEXT NOT NULL DEFAULT 'null',
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_workflow_executions_attachment
                ON workflow_executions(attachment_id);
        "#,
    },
];

pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| migration_err("create _schema_versions", e))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying schema migration"
        );
        apply(conn, migration).await?;
    }

    let version = applied_version(conn).await?;
    tracing::info!(version, "Schema migrated");
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let label = format!("V{} {}", migration.version, migration.name);
    let tx = conn
        .transaction()
        .await
        .map_err(|e| migration_err(&label, e))?;
    tx.execute_batch(migration.sql)
        .await
        .map_err(|e| migration_err(&label, e))?;
    tx.execute(
        "INSERT INTO _schema_versions (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(|e| migration_err(&label, e))?;
    tx.commit().await.map_err(|e| migration_err(&label, e))
}

/// Highest recorded version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _schema_versions", ())
        .await
        .map_err(|e| migration_err("read schema version", e))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| migration_err("read schema version", e))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| migration_err("read schema version", e))
}

fn migration_err(what: &str, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{what}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap()
            .connect()
            .unwrap()
    }

    async fn table_names(conn: &Connection) -> Vec<String> {
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                (),
            )
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(0).unwrap());
        }
        names
    }

    #[tokio::test]
    async fn fresh_database_gets_every_table() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();

        let names = table_names(&conn).await;
        for expected in [
            "_schema_versions",
            "parse_results",
            "submission_attempts",
            "submissions",
            "tenants",
            "workflow_executions",
            "workflow_steps",
            "workflows",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn migrations_run_on_a_spawned_task() {
        // tokio::spawn only accepts Send futures.
        let conn = memory_conn().await;
        let conn = tokio::spawn(async move {
            run_migrations(&conn).await.map(|()| conn)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(applied_version(&conn).await.unwrap(), MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn rerun_applies_nothing() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        assert_eq!(
            applied_version(&conn).await.unwrap(),
            MIGRATIONS.last().unwrap().version
        );
        let mut rows = conn
            .query("SELECT COUNT(*) FROM _schema_versions", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }

    #[test]
    fn versions_strictly_increase() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
    }
}
