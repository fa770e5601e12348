//! SQLite implementation of the backing store.
//!
//! Values, lists and counters live in three tables created by the crate
//! migrations. Every [`Batch`] and every [`BackingStore::transfer`] runs in a
//! single transaction on a dedicated one-connection writer pool, so writers
//! never race each other for the database lock. Reads go through a separate
//! pool and see committed state only (WAL mode).

use std::time::Duration;

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqliteConnection, SqlitePool,
};
use tokio_stream::StreamExt;

use crate::error::Error;

use super::{BackingStore, Batch, Guard, Op, StoreFuture};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn to_limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// A backing store persisted in a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    pub async fn connect(path: impl AsRef<str>) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(Duration::from_secs(5))
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts.clone())
            .await?;

        sqlx::migrate!("./migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        tracing::debug!(path = path.as_ref(), "Opened SQLite backing store");

        Ok(Self { writer, reader })
    }

    async fn holds(db: &mut SqliteConnection, guard: &Guard, now: i64) -> Result<bool, Error> {
        let holds = match guard {
            Guard::Member { list, value } => {
                sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM kv_lists WHERE key = $1 AND value = $2)",
                )
                .bind(list)
                .bind(value)
                .fetch_one(&mut *db)
                .await?
            }
            Guard::Absent { key } => {
                !sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM kv_values WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2))",
                )
                .bind(key)
                .bind(now)
                .fetch_one(&mut *db)
                .await?
            }
            Guard::Unchanged { key, value } => {
                let current: Option<Vec<u8>> = sqlx::query_scalar(
                    "SELECT value FROM kv_values WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2)",
                )
                .bind(key)
                .bind(now)
                .fetch_optional(&mut *db)
                .await?;

                current.as_ref() == Some(value)
            }
        };

        Ok(holds)
    }

    async fn apply(db: &mut SqliteConnection, op: Op, now: i64) -> Result<(), Error> {
        match op {
            Op::Set { key, value, ttl } => {
                let expires_at =
                    ttl.map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)));
                sqlx::query(
                    "
                    INSERT INTO kv_values (key, value, expires_at) VALUES ($1, $2, $3)
                    ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
                    ",
                )
                .bind(key)
                .bind(value)
                .bind(expires_at)
                .execute(&mut *db)
                .await?;
            }
            Op::Delete { key } => {
                sqlx::query("DELETE FROM kv_values WHERE key = $1")
                    .bind(key)
                    .execute(&mut *db)
                    .await?;
            }
            Op::Push { list, value } => {
                sqlx::query("INSERT INTO kv_lists (key, value) VALUES ($1, $2)")
                    .bind(list)
                    .bind(value)
                    .execute(&mut *db)
                    .await?;
            }
            Op::PushUnique { list, value } => {
                sqlx::query(
                    "
                    INSERT INTO kv_lists (key, value)
                    SELECT $1, $2
                    WHERE NOT EXISTS (SELECT 1 FROM kv_lists WHERE key = $1 AND value = $2)
                    ",
                )
                .bind(list)
                .bind(value)
                .execute(&mut *db)
                .await?;
            }
            Op::Remove { list, value } => {
                sqlx::query("DELETE FROM kv_lists WHERE key = $1 AND value = $2")
                    .bind(list)
                    .bind(value)
                    .execute(&mut *db)
                    .await?;
            }
            Op::Incr { counter, delta } => {
                sqlx::query(
                    "
                    INSERT INTO kv_counters (key, value) VALUES ($1, $2)
                    ON CONFLICT (key) DO UPDATE SET value = value + excluded.value
                    ",
                )
                .bind(counter)
                .bind(delta)
                .execute(&mut *db)
                .await?;
            }
            Op::Recount { counter, lists } => {
                let mut value: i64 = 0;
                for list in lists {
                    let len: i64 =
                        sqlx::query_scalar("SELECT COUNT(*) FROM kv_lists WHERE key = $1")
                            .bind(list)
                            .fetch_one(&mut *db)
                            .await?;
                    value += len;
                }

                sqlx::query(
                    "
                    INSERT INTO kv_counters (key, value) VALUES ($1, $2)
                    ON CONFLICT (key) DO UPDATE SET value = excluded.value
                    ",
                )
                .bind(counter)
                .bind(value)
                .execute(&mut *db)
                .await?;
            }
        }

        Ok(())
    }
}

impl BackingStore for SqliteStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            Ok(sqlx::query_scalar(
                "SELECT value FROM kv_values WHERE key = $1 AND (expires_at IS NULL OR expires_at > $2)",
            )
            .bind(key)
            .bind(now_millis())
            .fetch_optional(&self.reader)
            .await?)
        })
    }

    fn transfer<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut tx = self.writer.begin().await?;

            let value: Option<String> = sqlx::query_scalar(
                "
                DELETE FROM kv_lists
                WHERE id = (SELECT id FROM kv_lists WHERE key = $1 ORDER BY id LIMIT 1)
                RETURNING value
                ",
            )
            .bind(from)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(value) = value else {
                tx.rollback().await?;
                return Ok(None);
            };

            sqlx::query("INSERT INTO kv_lists (key, value) VALUES ($1, $2)")
                .bind(to)
                .bind(&value)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            Ok(Some(value))
        })
    }

    fn range<'a>(
        &'a self,
        list: &'a str,
        offset: usize,
        limit: usize,
    ) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut stream = sqlx::query_scalar::<_, String>(
                "SELECT value FROM kv_lists WHERE key = $1 ORDER BY id LIMIT $2 OFFSET $3",
            )
            .bind(list)
            .bind(to_limit(limit))
            .bind(to_limit(offset))
            .fetch(&self.reader);

            let mut values = Vec::new();

            while let Some(value) = stream.next().await.transpose()? {
                values.push(value);
            }

            Ok(values)
        })
    }

    fn len<'a>(&'a self, list: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let len: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_lists WHERE key = $1")
                .bind(list)
                .fetch_one(&self.reader)
                .await?;
            Ok(len as u64)
        })
    }

    fn contains<'a>(&'a self, list: &'a str, value: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            Ok(sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM kv_lists WHERE key = $1 AND value = $2)",
            )
            .bind(list)
            .bind(value)
            .fetch_one(&self.reader)
            .await?)
        })
    }

    fn counter<'a>(&'a self, counter: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let value: Option<i64> =
                sqlx::query_scalar("SELECT value FROM kv_counters WHERE key = $1")
                    .bind(counter)
                    .fetch_optional(&self.reader)
                    .await?;
            Ok(value.unwrap_or(0))
        })
    }

    fn commit(&self, batch: Batch) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let now = now_millis();
            let mut tx = self.writer.begin().await?;

            for guard in &batch.guards {
                if !Self::holds(&mut *tx, guard, now).await? {
                    tx.rollback().await?;
                    return Ok(false);
                }
            }

            for op in batch.ops {
                Self::apply(&mut *tx, op, now).await?;
            }

            tx.commit().await?;

            Ok(true)
        })
    }

    fn evict_expired(&self) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let res = sqlx::query(
                "DELETE FROM kv_values WHERE expires_at IS NOT NULL AND expires_at <= $1",
            )
            .bind(now_millis())
            .execute(&self.writer)
            .await?;
            Ok(res.rows_affected())
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.reader.close().await;
            self.writer.close().await;
            Ok(())
        })
    }
}
