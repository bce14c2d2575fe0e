//! Local SQL server administration
//!
//! Databases are created on the developer's local Postgres or MySQL server
//! when missing. A concurrent "already exists" answer counts as success.

use async_trait::async_trait;
use keel_gcp::sql::{DatabaseEngine, LocalSqlConnection};
use sqlx::mysql::MySqlConnection;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::{EmulatorError, EmulatorResult};

const PG_DUPLICATE_DATABASE: &str = "42P04";
const MYSQL_DATABASE_EXISTS: &str = "database exists";

/// Database administration on the local server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SqlAdmin: Send + Sync {
    /// Whether the database exists
    async fn database_exists(&self, conn: &LocalSqlConnection, name: &str) -> EmulatorResult<bool>;

    /// Create the database; an existing database is not an error
    async fn create_database(&self, conn: &LocalSqlConnection, name: &str) -> EmulatorResult<()>;
}

/// Database names are interpolated into DDL, so only plain identifiers pass
pub fn validate_database_name(name: &str) -> EmulatorResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(EmulatorError::InvalidName(name.to_string()))
    }
}

/// Whether a server error means the database is already there
pub fn is_already_exists(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some(PG_DUPLICATE_DATABASE)
                || db.message().contains(MYSQL_DATABASE_EXISTS)
                || db.message().contains("already exists")
        }
        _ => false,
    }
}

/// Admin client for the local database server.
///
/// Endpoint URLs from the stack configuration override the connection's
/// fixed defaults.
#[derive(Clone, Debug, Default)]
pub struct LocalSqlServer {
    postgres_url: Option<String>,
    mysql_url: Option<String>,
}

impl LocalSqlServer {
    /// Client with optional per-engine URL overrides
    pub fn new(postgres_url: Option<String>, mysql_url: Option<String>) -> Self {
        Self {
            postgres_url,
            mysql_url,
        }
    }

    /// URL used for administrative statements against `conn`'s engine
    pub fn admin_url(&self, conn: &LocalSqlConnection) -> String {
        let configured = match conn.engine {
            DatabaseEngine::Postgres => self.postgres_url.as_ref(),
            DatabaseEngine::Mysql => self.mysql_url.as_ref(),
        };
        configured.cloned().unwrap_or_else(|| conn.url())
    }
}

#[async_trait]
impl SqlAdmin for LocalSqlServer {
    async fn database_exists(&self, conn: &LocalSqlConnection, name: &str) -> EmulatorResult<bool> {
        let url = self.admin_url(conn);
        let found = match conn.engine {
            DatabaseEngine::Postgres => {
                let mut c = PgConnection::connect(&url).await?;
                sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
                    .bind(name)
                    .fetch_optional(&mut c)
                    .await?
                    .is_some()
            }
            DatabaseEngine::Mysql => {
                let mut c = MySqlConnection::connect(&url).await?;
                sqlx::query("SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = ?")
                    .bind(name)
                    .fetch_optional(&mut c)
                    .await?
                    .is_some()
            }
        };
        Ok(found)
    }

    async fn create_database(&self, conn: &LocalSqlConnection, name: &str) -> EmulatorResult<()> {
        validate_database_name(name)?;
        let url = self.admin_url(conn);
        let result = match conn.engine {
            DatabaseEngine::Postgres => {
                let mut c = PgConnection::connect(&url).await?;
                sqlx::query(&format!("CREATE DATABASE \"{}\"", name))
                    .execute(&mut c)
                    .await
                    .map(|_| ())
            }
            DatabaseEngine::Mysql => {
                let mut c = MySqlConnection::connect(&url).await?;
                sqlx::query(&format!("CREATE DATABASE `{}`", name))
                    .execute(&mut c)
                    .await
                    .map(|_| ())
            }
        };
        match result {
            Err(e) if is_already_exists(&e) => {
                debug!(database = %name, "already exists");
                Ok(())
            }
            other => Ok(other?),
        }
    }
}
