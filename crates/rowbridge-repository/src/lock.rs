use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::task;
use uuid::Uuid;

use crate::RepositoryError;

/// Session-level advisory lock serialising runs of one mapping.
///
/// Held on a dedicated pool connection; dropping without `release` unlocks in the background.
pub struct MappingLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl MappingLock {
    /// Waits until no other session holds the lock for this mapping.
    pub async fn acquire(pool: &PgPool, mapping_id: Uuid) -> Result<Self, RepositoryError> {
        let key = lock_key(mapping_id);
        let mut conn = pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(conn.as_mut())
            .await?;
        tracing::debug!(%mapping_id, key, "acquired mapping lock");
        Ok(Self {
            conn: Some(conn),
            key,
        })
    }

    /// Returns `None` when another session already holds the lock.
    pub async fn try_acquire(pool: &PgPool, mapping_id: Uuid) -> Result<Option<Self>, RepositoryError> {
        let key = lock_key(mapping_id);
        let mut conn = pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(conn.as_mut())
            .await?;
        if !locked {
            return Ok(None);
        }
        Ok(Some(Self {
            conn: Some(conn),
            key,
        }))
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub async fn release(mut self) -> Result<(), RepositoryError> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(conn.as_mut())
                .await?;
        }
        Ok(())
    }
}

impl Drop for MappingLock {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let key = self.key;
            task::spawn(async move {
                if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(conn.as_mut())
                    .await
                {
                    tracing::warn!("failed to release mapping lock in drop: {err}");
                }
            });
        }
    }
}

/// Folds the 128-bit id into the 64-bit advisory lock key space.
pub fn lock_key(mapping_id: Uuid) -> i64 {
    let (high, low) = mapping_id.as_u64_pair();
    (high ^ low) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable_and_distinguishes_ids() {
        let id = Uuid::parse_str("6f1c2a3e-0000-4000-8000-00000000002a").expect("uuid");
        assert_eq!(lock_key(id), lock_key(id));
        assert_ne!(lock_key(id), lock_key(Uuid::new_v4()));
        assert_eq!(lock_key(Uuid::nil()), 0);
    }
}
