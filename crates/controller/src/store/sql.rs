//! PostgreSQL metadata store
//!
//! Two tables: `controller_kv` for keys and `controller_locks` for leases.
//! A trigger publishes every lock row change on the `controller_locks`
//! channel; watchers LISTEN on it. A reaper task deletes expired lock rows
//! so their release is published too.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{Pool, Postgres, Row};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{is_direct_child, LockEvent, LockWatch, MetadataStore, StoreError, StoreResult};
use crate::config::SqlConfig;

const LOCK_CHANNEL: &str = "controller_locks";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS controller_kv (
        key TEXT PRIMARY KEY,
        value BYTEA NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS controller_locks (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE OR REPLACE FUNCTION controller_locks_notify() RETURNS trigger AS $$
    BEGIN
        IF TG_OP = 'DELETE' THEN
            PERFORM pg_notify('controller_locks', OLD.name);
        ELSE
            PERFORM pg_notify('controller_locks', NEW.name);
        END IF;
        RETURN NULL;
    END;
    $$ LANGUAGE plpgsql
    "#,
    r#"
    CREATE OR REPLACE TRIGGER controller_locks_changed
        AFTER INSERT OR UPDATE OR DELETE ON controller_locks
        FOR EACH ROW EXECUTE FUNCTION controller_locks_notify()
    "#,
];

fn unavailable(context: &str, e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(format!("sql {}: {}", context, e))
}

fn ttl_secs(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

async fn current_holder(pool: &Pool<Postgres>, name: &str) -> StoreResult<Option<String>> {
    let row = sqlx::query(
        r#"
        SELECT holder
          FROM controller_locks
         WHERE name = $1 AND expires_at > NOW()
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .map_err(|e| unavailable("read lock", e))?;
    Ok(row.map(|row| row.get("holder")))
}

fn lock_event(holder: Option<String>) -> LockEvent {
    match holder {
        Some(holder) => LockEvent::held(holder),
        None => LockEvent::released(),
    }
}

pub struct SqlStore {
    pool: Pool<Postgres>,
    reaper: JoinHandle<()>,
}

impl SqlStore {
    pub async fn connect(config: &SqlConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.url)
            .await
            .map_err(|e| unavailable("connect", e))?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| unavailable("create schema", e))?;
        }
        info!("SQL metadata schema ready");

        let reaper = tokio::spawn(reap_expired_locks(
            pool.clone(),
            Duration::from_millis(config.lock_reap_interval_ms.max(100)),
        ));
        Ok(Self { pool, reaper })
    }
}

impl Drop for SqlStore {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

async fn reap_expired_locks(pool: Pool<Postgres>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match sqlx::query("DELETE FROM controller_locks WHERE expires_at <= NOW()")
            .execute(&pool)
            .await
        {
            Ok(done) if done.rows_affected() > 0 => {
                debug!("Reaped {} expired locks", done.rows_affected())
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to reap expired locks: {}", e),
        }
    }
}

#[async_trait]
impl MetadataStore for SqlStore {
    fn backend(&self) -> &'static str {
        "sql"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM controller_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unavailable("get", e))?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO controller_kv (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("put", e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM controller_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("delete", e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query(
            r#"
            SELECT key, value
              FROM controller_kv
             WHERE starts_with(key, $1)
             ORDER BY key
            "#,
        )
        .bind(format!("{}/", prefix))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("list", e))?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("key"), row.get::<Vec<u8>, _>("value")))
            .filter(|(key, _)| is_direct_child(prefix, key))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> StoreResult<()> {
        let done = match expected {
            None => sqlx::query(
                r#"
                INSERT INTO controller_kv (key, value)
                VALUES ($1, $2)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await,
            Some(expected) => sqlx::query(
                r#"
                UPDATE controller_kv
                   SET value = $3
                 WHERE key = $1 AND value = $2
                "#,
            )
            .bind(key)
            .bind(expected)
            .bind(value)
            .execute(&self.pool)
            .await,
        }
        .map_err(|e| unavailable("cas", e))?;
        if done.rows_affected() > 0 {
            Ok(())
        } else {
            Err(StoreError::Conflict(key.to_string()))
        }
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let done = sqlx::query(
            r#"
            INSERT INTO controller_locks (name, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
               SET holder = EXCLUDED.holder,
                   expires_at = EXCLUDED.expires_at
             WHERE controller_locks.holder = EXCLUDED.holder
                OR controller_locks.expires_at <= NOW()
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl_secs(ttl))
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("acquire lock", e))?;
        if done.rows_affected() > 0 {
            return Ok(());
        }
        let current = current_holder(&self.pool, name)
            .await?
            .unwrap_or_else(|| "unknown".to_string());
        Err(StoreError::AlreadyHeld {
            name: name.to_string(),
            holder: current,
        })
    }

    async fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let done = sqlx::query(
            r#"
            UPDATE controller_locks
               SET expires_at = NOW() + make_interval(secs => $3)
             WHERE name = $1 AND holder = $2 AND expires_at > NOW()
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl_secs(ttl))
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("renew lock", e))?;
        if done.rows_affected() > 0 {
            Ok(())
        } else {
            Err(StoreError::LockLost(name.to_string()))
        }
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM controller_locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("release lock", e))?;
        Ok(())
    }

    async fn watch_lock(&self, name: &str) -> StoreResult<LockWatch> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| unavailable("listen", e))?;
        listener
            .listen(LOCK_CHANNEL)
            .await
            .map_err(|e| unavailable("listen", e))?;
        let initial = lock_event(current_holder(&self.pool, name).await?);

        let pool = self.pool.clone();
        let name = name.to_string();
        let (tx, watch) = LockWatch::channel();
        tokio::spawn(async move {
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(e) => {
                        warn!("Lock listener for {} ended: {}", name, e);
                        return;
                    }
                };
                if notification.payload() != name {
                    continue;
                }
                let event = match current_holder(&pool, &name).await {
                    Ok(holder) => lock_event(holder),
                    Err(e) => {
                        warn!("Lock listener for {} ended: {}", name, e);
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(watch)
    }
}
