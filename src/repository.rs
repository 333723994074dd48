//! Typed persistence operations over Attempts, Tests, and TestResults.
//!
//! Every public method here corresponds to one contract in the system's
//! component design. Callers (the tasker loop, the admin seeder) never
//! write raw SQL themselves.

use sqlx::{PgPool, Postgres, Transaction};

use crate::db::models::{Attempt, Test, TestResultStatus, User};
use crate::prelude::*;

/// A single row to insert via [`Repository::upsert_tests`].
#[derive(Debug, Clone)]
pub struct NewTest {
    pub model: String,
    pub payload: String,
    pub is_active: bool,
    pub total_tokens: Option<i64>,
}

/// Thin wrapper around a connection pool exposing the operations the
/// tasker and admin seeder need. Holds no other state.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bulk insert tests keyed by the `(model, payload)` uniqueness
    /// invariant; existing rows are left untouched. Returns the number of
    /// newly inserted rows.
    #[instrument(level = "debug", skip(self, rows))]
    pub async fn upsert_tests(&self, rows: &[NewTest]) -> Result<u64> {
        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO tests (model, payload, is_active, total_tokens)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (model, payload) DO NOTHING
                "#,
            )
            .bind(&row.model)
            .bind(&row.payload)
            .bind(row.is_active)
            .bind(row.total_tokens)
            .execute(&mut *tx)
            .await
            .context("failed to insert test row")?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Return the Attempt with the oldest `timestamp` that still has
    /// unfinished work (see module docs on the three-part eligibility rule),
    /// or `None` if no such Attempt exists. An attempt with zero active
    /// tests is eligible too, so it can be driven straight to completion
    /// with an average of 0 the first time it's picked up.
    #[instrument(level = "debug", skip(self))]
    pub async fn next_attempt_with_pending_work(&self) -> Result<Option<Attempt>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let attempt = sqlx::query_as::<_, Attempt>(
            r#"
            SELECT a.id, a."timestamp", a.compressing_prompt, a.model, a.login,
                   a.average_compression_ratio
            FROM attempts a
            WHERE a.average_compression_ratio IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM test_results tr
                  WHERE tr.attempt_id = a.id AND tr.status = 'FAILED'
              )
              AND (
                  EXISTS (
                      SELECT 1 FROM tests t
                      WHERE t.is_active
                        AND NOT EXISTS (
                            SELECT 1 FROM test_results tr2
                            WHERE tr2.attempt_id = a.id AND tr2.test_id = t.id
                        )
                  )
                  OR NOT EXISTS (SELECT 1 FROM tests WHERE is_active)
              )
            ORDER BY a."timestamp" ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .context("failed to query for the next attempt with pending work")?;

        tx.commit().await?;
        Ok(attempt)
    }

    /// Return every active Test for which `attempt` has no TestResult, or
    /// has one left in PENDING status by a crashed worker.
    #[instrument(level = "debug", skip(self))]
    pub async fn unfinished_active_tests(&self, attempt_id: i64) -> Result<Vec<Test>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let tests = sqlx::query_as::<_, Test>(
            r#"
            SELECT t.id, t.model, t.payload, t.is_active, t.total_tokens
            FROM tests t
            WHERE t.is_active
              AND (
                  NOT EXISTS (
                      SELECT 1 FROM test_results tr
                      WHERE tr.attempt_id = $1 AND tr.test_id = t.id
                  )
                  OR EXISTS (
                      SELECT 1 FROM test_results tr
                      WHERE tr.attempt_id = $1 AND tr.test_id = t.id
                        AND tr.status = 'PENDING'
                  )
              )
            ORDER BY t.id ASC
            "#,
        )
        .bind(attempt_id)
        .fetch_all(&mut *tx)
        .await
        .context("failed to query unfinished active tests")?;

        tx.commit().await?;
        Ok(tests)
    }

    /// Atomically attempt to insert a PENDING TestResult, reserving this
    /// `(attempt_id, test_id)` slot. Returns `true` on success, `false` when
    /// another worker already owns the slot.
    #[instrument(level = "debug", skip(self))]
    pub async fn claim_test_result(&self, attempt_id: i64, test_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO test_results (attempt_id, test_id, status)
            VALUES ($1, $2, 'PENDING')
            ON CONFLICT (attempt_id, test_id) DO NOTHING
            "#,
        )
        .bind(attempt_id)
        .bind(test_id)
        .execute(&self.pool)
        .await
        .context("failed to claim test result")?;
        Ok(result.rows_affected() == 1)
    }

    /// Update a claimed (PENDING) TestResult in place with its terminal
    /// outcome. Idempotent if invoked twice with the same final status.
    #[instrument(level = "debug", skip(self, request_json))]
    pub async fn finalize_test_result(
        &self,
        attempt_id: i64,
        test_id: i64,
        status: TestResultStatus,
        compressed_prompt: Option<&str>,
        compression_ratio: Option<f64>,
        request_json: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE test_results
            SET status = $3,
                compressed_prompt = $4,
                compression_ratio = $5,
                request_json = $6,
                last_modified = now()
            WHERE attempt_id = $1 AND test_id = $2
            "#,
        )
        .bind(attempt_id)
        .bind(test_id)
        .bind(status)
        .bind(compressed_prompt)
        .bind(compression_ratio)
        .bind(request_json)
        .execute(&self.pool)
        .await
        .context("failed to finalize test result")?;
        Ok(())
    }

    /// Set the terminal `average_compression_ratio` field on an Attempt.
    #[instrument(level = "debug", skip(self))]
    pub async fn mark_attempt_complete(
        &self,
        attempt_id: i64,
        average_compression_ratio: f64,
    ) -> Result<()> {
        sqlx::query("UPDATE attempts SET average_compression_ratio = $2 WHERE id = $1")
            .bind(attempt_id)
            .bind(average_compression_ratio)
            .execute(&self.pool)
            .await
            .context("failed to mark attempt complete")?;
        Ok(())
    }

    /// Look up a user by login or email, used by the admin seeder to decide
    /// whether seeding is necessary.
    pub async fn find_user_by_login_or_email(
        &self,
        login: &str,
        email: &str,
    ) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT login, email, password_hash, is_admin FROM users WHERE login = $1 OR email = $2",
        )
        .bind(login)
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up user")?;
        Ok(user)
    }

    /// Insert a new administrator user.
    pub async fn insert_admin_user(
        &self,
        login: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (login, email, password_hash, is_admin) VALUES ($1, $2, $3, TRUE)",
        )
        .bind(login)
        .bind(email)
        .bind(password_hash)
        .execute(&self.pool)
        .await
        .context("failed to insert admin user")?;
        Ok(())
    }

    /// Access to the underlying pool, for callers that need a transaction
    /// spanning more than one repository method (currently unused by the
    /// tasker, kept for future multi-step writes).
    #[allow(dead_code)]
    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Raw pool access for integration tests, which need to set up Attempt
    /// rows directly (Attempt creation belongs to the out-of-scope HTTP
    /// API, so there is no `Repository` method for it).
    #[doc(hidden)]
    pub fn pool_for_tests(&self) -> &PgPool {
        &self.pool
    }
}
