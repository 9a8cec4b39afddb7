use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;

use crate::error::StoreError;

/// A held Postgres advisory lock.
///
/// The lock is session-scoped, so it lives on a dedicated pooled
/// connection for as long as the guard exists. Callers must `release()`
/// it; if the guard is dropped without releasing, the connection is
/// detached from the pool and closed so the server frees the lock instead
/// of leaking it to the connection's next borrower.
pub struct AdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    class_id: i32,
    key_id: i32,
}

impl AdvisoryLock {
    pub(crate) async fn try_acquire(
        pool: &PgPool,
        class_id: i32,
        key_id: i32,
    ) -> Result<Option<Self>, StoreError> {
        let mut conn = pool.acquire().await?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
            .bind(class_id)
            .bind(key_id)
            .fetch_one(&mut *conn)
            .await?;

        if locked {
            Ok(Some(Self {
                conn: Some(conn),
                class_id,
                key_id,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                .bind(self.class_id)
                .bind(self.key_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(
                class_id = self.class_id,
                key_id = self.key_id,
                "advisory lock dropped without release, closing its connection"
            );
            drop(conn.detach());
        }
    }
}
