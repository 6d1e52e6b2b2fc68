use anyhow::Result;
use sqlx::PgPool;
use tracing::{error, info, warn};

/// Key for `pg_advisory_lock`; any stable 64-bit value shared by all nodes
const MIGRATION_LOCK_KEY: i64 = 0x6761_7465_6875_62;

/// Run database migrations under a session-level advisory lock so that only
/// one replica migrates at a time. Waiting replicas find the migrations
/// already applied once they get the lock.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    let mut conn = pool.acquire().await?;
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to acquire migration lock: {e}"))?;

    let result = if migrations_already_applied(pool).await {
        info!("Migrations already applied, skipping");
        Ok(())
    } else {
        run_migrate(pool).await
    };

    // Best effort: the lock is dropped with the session anyway
    if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await
    {
        warn!("Failed to release migration lock: {}", e);
    }

    if result.is_ok() {
        info!("Migrations completed");
    }
    result
}

/// The single place that expands `sqlx::migrate!` for running
async fn run_migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            anyhow::anyhow!("Migration failed: {e}")
        })
}

/// Compare the embedded migrator against `_sqlx_migrations`
async fn migrations_already_applied(pool: &PgPool) -> bool {
    let migrator = sqlx::migrate!("../migrations");
    let applied: Vec<(i64,)> =
        match sqlx::query_as("SELECT version FROM _sqlx_migrations WHERE success ORDER BY version")
            .fetch_all(pool)
            .await
        {
            Ok(rows) => rows,
            Err(_) => return false, // table may not exist yet
        };

    let applied_versions: std::collections::HashSet<i64> =
        applied.into_iter().map(|(v,)| v).collect();

    migrator
        .migrations
        .iter()
        .all(|m| applied_versions.contains(&m.version))
}
