//! PostgreSQL account store (schema in `sql/schema.sql`).

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{
    PgPool, Postgres, Row,
    postgres::{PgArguments, PgPoolOptions, PgRow},
};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use super::{AccountStore, Page, StoreError, StoreResult};
use crate::account::{Account, normalize_email};

const ACCOUNT_COLUMNS: &str = "id, username, email, password_hash, is_email_confirmed, \
    email_confirmation_token, email_confirmation_expires, password_reset_token, \
    password_reset_expires, role, profile_picture, created_at, updated_at";

/// Moves `updated_at` strictly forward so a guarded save notices every write.
const TOUCHED: &str = "updated_at = GREATEST(NOW(), updated_at + INTERVAL '1 microsecond')";

#[derive(Clone, Debug)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `dsn` and check that the `accounts` table exists.
    ///
    /// The schema is not applied here; run `sql/schema.sql` against the
    /// database once before the first start.
    ///
    /// # Errors
    /// Returns an error if the database cannot be reached or the schema is missing.
    pub async fn connect(dsn: &SecretString) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn.expose_secret())
            .await
            .context("Failed to connect to database")?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let present: bool = sqlx::query_scalar("SELECT to_regclass('accounts') IS NOT NULL")
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("Failed to inspect database schema")?;
        if !present {
            bail!("Table `accounts` not found; apply sql/schema.sql first");
        }
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        bind: &str,
    ) -> StoreResult<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {clause} LIMIT 1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(&query)
            .bind(bind)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to look up account"))?;
        row.as_ref().map(account_from_row).transpose()
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

impl PgAccountStore {
    /// Run a single-row `UPDATE ... RETURNING` inside a `db.query` span.
    async fn update_one(
        &self,
        query: PgQuery<'_>,
        context: &'static str,
    ) -> StoreResult<Option<Account>> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        let row = query
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, context))?;
        row.as_ref().map(account_from_row).transpose()
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Name the unique column a violation refers to, from its constraint name.
fn conflict_field(err: &sqlx::Error) -> &'static str {
    let constraint = match err {
        sqlx::Error::Database(db_err) => db_err.constraint().unwrap_or_default(),
        _ => "",
    };
    if constraint.contains("username") {
        "username"
    } else {
        "email"
    }
}

fn backend(err: sqlx::Error, context: &'static str) -> StoreError {
    if is_unique_violation(&err) {
        return StoreError::Conflict(conflict_field(&err));
    }
    StoreError::Backend(anyhow::Error::new(err).context(context))
}

fn account_from_row(row: &PgRow) -> StoreResult<Account> {
    let decode = |err: sqlx::Error| StoreError::Backend(anyhow::Error::new(err).context("Failed to decode account row"));
    let role: String = row.try_get("role").map_err(decode)?;
    Ok(Account {
        id: row.try_get("id").map_err(decode)?,
        username: row.try_get("username").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        password_hash: row.try_get("password_hash").map_err(decode)?,
        is_email_confirmed: row.try_get("is_email_confirmed").map_err(decode)?,
        email_confirmation_token: row.try_get("email_confirmation_token").map_err(decode)?,
        email_confirmation_expires: row.try_get("email_confirmation_expires").map_err(decode)?,
        password_reset_token: row.try_get("password_reset_token").map_err(decode)?,
        password_reset_expires: row.try_get("password_reset_expires").map_err(decode)?,
        role: role.parse().map_err(|err: String| StoreError::Backend(anyhow!(err)))?,
        profile_picture: row.try_get("profile_picture").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn create(&self, account: Account) -> StoreResult<Account> {
        let query = format!(
            "INSERT INTO accounts ({ACCOUNT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT"
        );
        let row = sqlx::query(&query)
            .bind(account.id)
            .bind(&account.username)
            .bind(normalize_email(&account.email))
            .bind(&account.password_hash)
            .bind(account.is_email_confirmed)
            .bind(&account.email_confirmation_token)
            .bind(account.email_confirmation_expires)
            .bind(&account.password_reset_token)
            .bind(account.password_reset_expires)
            .bind(account.role.as_str())
            .bind(&account.profile_picture)
            .bind(account.created_at)
            .bind(account.updated_at)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to insert account"))?;
        account_from_row(&row)
    }

    async fn find_by_email_or_username(
        &self,
        email: &str,
        username: &str,
    ) -> StoreResult<Option<Account>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = $1 OR username = $2 \
             ORDER BY (email = $1) DESC LIMIT 1"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(&query)
            .bind(normalize_email(email))
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to look up account"))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        self.fetch_one_where("email = $1", &normalize_email(email))
            .await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to look up account"))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_by_confirmation_token(&self, token: &str) -> StoreResult<Option<Account>> {
        self.fetch_one_where("email_confirmation_token = $1", token)
            .await
    }

    async fn find_by_active_reset_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE password_reset_token = $1 AND password_reset_expires > $2"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let row = sqlx::query(&query)
            .bind(token)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to look up reset token"))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn set_confirmation_challenge(
        &self,
        id: Uuid,
        token: &str,
        expires: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let query = format!(
            "UPDATE accounts SET email_confirmation_token = $2, \
             email_confirmation_expires = $3, {TOUCHED} \
             WHERE id = $1 AND is_email_confirmed = FALSE RETURNING {ACCOUNT_COLUMNS}"
        );
        let query = sqlx::query(&query).bind(id).bind(token).bind(expires);
        self.update_one(query, "Failed to set confirmation challenge")
            .await
    }

    async fn set_reset_challenge(
        &self,
        id: Uuid,
        token: &str,
        expires: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let query = format!(
            "UPDATE accounts SET password_reset_token = $2, password_reset_expires = $3, \
             {TOUCHED} WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        );
        let query = sqlx::query(&query).bind(id).bind(token).bind(expires);
        self.update_one(query, "Failed to set reset challenge").await
    }

    async fn update_password_hash(
        &self,
        id: Uuid,
        password_hash: &str,
    ) -> StoreResult<Option<Account>> {
        let query = format!(
            "UPDATE accounts SET password_hash = $2, {TOUCHED} \
             WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        );
        let query = sqlx::query(&query).bind(id).bind(password_hash);
        self.update_one(query, "Failed to update password").await
    }

    async fn update_profile(
        &self,
        id: Uuid,
        username: Option<&str>,
        profile_picture: Option<&str>,
    ) -> StoreResult<Option<Account>> {
        let query = format!(
            "UPDATE accounts SET username = COALESCE($2, username), \
             profile_picture = COALESCE($3, profile_picture), {TOUCHED} \
             WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        );
        let query = sqlx::query(&query).bind(id).bind(username).bind(profile_picture);
        self.update_one(query, "Failed to update profile").await
    }

    async fn save(&self, account: &Account) -> StoreResult<Option<Account>> {
        let query = format!(
            "UPDATE accounts SET username = $2, email = $3, password_hash = $4, \
             is_email_confirmed = $5, email_confirmation_token = $6, \
             email_confirmation_expires = $7, password_reset_token = $8, \
             password_reset_expires = $9, role = $10, profile_picture = $11, {TOUCHED} \
             WHERE id = $1 AND updated_at = $12 RETURNING {ACCOUNT_COLUMNS}"
        );
        let query = sqlx::query(&query)
            .bind(account.id)
            .bind(&account.username)
            .bind(normalize_email(&account.email))
            .bind(&account.password_hash)
            .bind(account.is_email_confirmed)
            .bind(&account.email_confirmation_token)
            .bind(account.email_confirmation_expires)
            .bind(&account.password_reset_token)
            .bind(account.password_reset_expires)
            .bind(account.role.as_str())
            .bind(&account.profile_picture)
            .bind(account.updated_at);
        if let Some(saved) = self.update_one(query, "Failed to save account").await? {
            return Ok(Some(saved));
        }
        match self.find_by_id(account.id).await? {
            Some(_) => Err(StoreError::Stale),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE"
        );
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to delete account"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_paginated(&self, page: u32, limit: u32) -> StoreResult<Page<Account>> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at DESC, id LIMIT $1 OFFSET $2"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let rows = sqlx::query(&query)
            .bind(i64::from(limit))
            .bind(offset)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to list accounts"))?;

        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let total: i64 = sqlx::query("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to count accounts"))?
            .get(0);

        Ok(Page {
            items: rows.iter().map(account_from_row).collect::<StoreResult<_>>()?,
            total: u64::try_from(total).unwrap_or(0),
            page,
            limit,
        })
    }

    async fn consume_confirmation(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let query = format!(
            "UPDATE accounts SET is_email_confirmed = TRUE, email_confirmation_token = NULL, \
             email_confirmation_expires = NULL, \
             updated_at = GREATEST($2, updated_at + INTERVAL '1 microsecond') \
             WHERE email_confirmation_token = $1 AND email_confirmation_expires > $2 \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        let row = sqlx::query(&query)
            .bind(token)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to consume confirmation token"))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn consume_reset(
        &self,
        token: &str,
        password_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Account>> {
        let query = format!(
            "UPDATE accounts SET password_hash = $2, password_reset_token = NULL, \
             password_reset_expires = NULL, \
             updated_at = GREATEST($3, updated_at + INTERVAL '1 microsecond') \
             WHERE password_reset_token = $1 AND password_reset_expires > $3 \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE"
        );
        let row = sqlx::query(&query)
            .bind(token)
            .bind(password_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| backend(err, "Failed to consume reset token"))?;
        row.as_ref().map(account_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
        constraint: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn constraint(&self) -> Option<&str> {
            self.constraint
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    fn db_error(code: &'static str, constraint: Option<&'static str>) -> sqlx::Error {
        sqlx::Error::Database(Box::new(TestDbError {
            code: Some(code),
            constraint,
        }))
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        assert!(is_unique_violation(&db_error("23505", None)));
        assert!(!is_unique_violation(&db_error("99999", None)));
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn unique_violation_names_the_column() {
        let err = backend(db_error("23505", Some("accounts_username_key")), "insert");
        assert!(matches!(err, StoreError::Conflict("username")));

        let err = backend(db_error("23505", Some("accounts_email_key")), "insert");
        assert!(matches!(err, StoreError::Conflict("email")));
    }

    #[test]
    fn other_failures_are_backend_errors() {
        let err = backend(sqlx::Error::PoolTimedOut, "select");
        assert!(matches!(err, StoreError::Backend(_)));
    }
}
