//! Users and their current token pair, one transaction per flow.

use crate::saml::error::{ErrorKind, SamlError};
use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntity {
    pub id: i64,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// # Errors
    /// Returns `DbBegin` if no transaction can be opened.
    async fn begin(&self) -> Result<Box<dyn UserTransaction>, SamlError>;
}

/// Open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait UserTransaction: Send {
    /// Not found is `Ok(None)`.
    async fn select_by_email(&mut self, email: &str) -> Result<Option<UserEntity>, SamlError>;

    async fn create_user(&mut self, email: &str) -> Result<UserEntity, SamlError>;

    async fn update_token(
        &mut self,
        user_id: i64,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), SamlError>;

    async fn commit(&mut self) -> Result<(), SamlError>;

    async fn rollback(&mut self) -> Result<(), SamlError>;
}

/// `UserRepository` backed by the `users` table.
#[derive(Debug, Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn begin(&self) -> Result<Box<dyn UserTransaction>, SamlError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SamlError::with_cause(ErrorKind::DbBegin, e))?;
        Ok(Box::new(PgUserTransaction { tx: Some(tx) }))
    }
}

struct PgUserTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUserTransaction {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, SamlError> {
        self.tx
            .as_mut()
            .ok_or_else(|| SamlError::with_cause(ErrorKind::DbQuery, "transaction already closed"))
    }
}

fn user_from_row(row: &PgRow) -> Result<UserEntity, SamlError> {
    let to_err = |e: sqlx::Error| SamlError::with_cause(ErrorKind::DbQueryResult, e);
    Ok(UserEntity {
        id: row.try_get("id").map_err(to_err)?,
        email: row.try_get("email").map_err(to_err)?,
        access_token: row.try_get("access_token").map_err(to_err)?,
        refresh_token: row.try_get("refresh_token").map_err(to_err)?,
    })
}

#[async_trait]
impl UserTransaction for PgUserTransaction {
    async fn select_by_email(&mut self, email: &str) -> Result<Option<UserEntity>, SamlError> {
        let query = "SELECT id, email, access_token, refresh_token FROM users WHERE email = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&mut **self.tx()?)
            .instrument(span)
            .await
            .map_err(|e| SamlError::with_cause(ErrorKind::DbQuery, e))?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn create_user(&mut self, email: &str) -> Result<UserEntity, SamlError> {
        let query = "INSERT INTO users (email) VALUES ($1) RETURNING id, email, access_token, refresh_token";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email)
            .fetch_one(&mut **self.tx()?)
            .instrument(span)
            .await
            .map_err(|e| SamlError::with_cause(ErrorKind::DbQuery, e))?;

        user_from_row(&row)
    }

    async fn update_token(
        &mut self,
        user_id: i64,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), SamlError> {
        let query = "UPDATE users SET access_token = $2, refresh_token = $3, updated_at = NOW() WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(access_token)
            .bind(refresh_token)
            .execute(&mut **self.tx()?)
            .instrument(span)
            .await
            .map_err(|e| SamlError::with_cause(ErrorKind::DbQuery, e))?;

        if result.rows_affected() == 0 {
            return Err(SamlError::with_cause(
                ErrorKind::DbQueryResult,
                format!("user {user_id} not found"),
            ));
        }

        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SamlError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SamlError::with_cause(ErrorKind::DbCommit, "transaction already closed"))?;
        tx.commit()
            .await
            .map_err(|e| SamlError::with_cause(ErrorKind::DbCommit, e))
    }

    async fn rollback(&mut self) -> Result<(), SamlError> {
        let tx = self.tx.take().ok_or_else(|| {
            SamlError::with_cause(ErrorKind::DbRollback, "transaction already closed")
        })?;
        tx.rollback()
            .await
            .map_err(|e| SamlError::with_cause(ErrorKind::DbRollback, e))
    }
}
