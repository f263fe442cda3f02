//! Create the target database before the pool connects to it.
//!
//! PostgreSQL is provisioned through the `postgres` maintenance database,
//! MySQL through a server-level connection. SQLite files are created by the
//! driver itself (`create_if_missing`).

use crate::config::DaoConfig;
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use sqlx::Connection;
use tracing::{debug, info};
use url::Url;

/// SQLSTATE for "database already exists" in PostgreSQL.
const PG_DUPLICATE_DATABASE: &str = "42P04";

/// Ensure the database named in `config` exists. Returns true when it was created.
pub async fn ensure_database(config: &DaoConfig) -> DbResult<bool> {
    let Some(name) = config.database.as_deref() else {
        return Err(DbError::invalid_input(
            "Cannot create a database: the connection URL names none",
        ));
    };
    validate_database_name(name)?;

    match config.db_type {
        DatabaseType::PostgreSQL => create_postgres(config, name).await,
        DatabaseType::MySQL => create_mysql(config, name).await,
        DatabaseType::SQLite => Ok(false),
    }
}

fn validate_database_name(name: &str) -> DbResult<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::invalid_input(format!(
            "Database name '{}' must only contain letters, digits and '_'",
            name
        )));
    }
    Ok(())
}

/// The same server URL pointed at another database.
fn admin_url(connection_string: &str, database: &str) -> DbResult<String> {
    let mut url = Url::parse(connection_string)
        .map_err(|e| DbError::invalid_input(format!("Invalid URL: {e}")))?;
    url.set_path(database);
    Ok(url.to_string())
}

async fn create_postgres(config: &DaoConfig, name: &str) -> DbResult<bool> {
    let admin = admin_url(&config.connection_string, "postgres")?;
    let mut conn = sqlx::PgConnection::connect(&admin).await?;

    let sql = format!(
        "CREATE DATABASE \"{}\" ENCODING 'UTF8' TEMPLATE template0",
        name
    );
    let created = match sqlx::query(&sql).execute(&mut conn).await {
        Ok(_) => true,
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(PG_DUPLICATE_DATABASE) => {
            debug!(database = %name, "Database already exists");
            false
        }
        Err(e) => {
            conn.close().await.ok();
            return Err(e.into());
        }
    };
    conn.close().await?;

    if created {
        info!(database = %name, "Created database");
    }
    Ok(created)
}

async fn create_mysql(config: &DaoConfig, name: &str) -> DbResult<bool> {
    let admin = admin_url(&config.connection_string, "/")?;
    let mut conn = sqlx::MySqlConnection::connect(&admin).await?;

    let sql = format!(
        "CREATE DATABASE IF NOT EXISTS `{}` CHARACTER SET utf8mb4",
        name
    );
    let result = sqlx::query(&sql).execute(&mut conn).await;
    conn.close().await.ok();

    // A zero row count means the database was already there
    let created = result?.rows_affected() > 0;
    if created {
        info!(database = %name, "Created database");
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_url_swaps_database() {
        let url = admin_url("postgres://u:p@db:5432/app?sslmode=disable", "postgres").unwrap();
        assert_eq!(url, "postgres://u:p@db:5432/postgres?sslmode=disable");
        let url = admin_url("mysql://u:p@db:3306/app", "/").unwrap();
        assert_eq!(url, "mysql://u:p@db:3306/");
    }

    #[test]
    fn test_database_name_validation() {
        assert!(validate_database_name("app_dev_1").is_ok());
        assert!(validate_database_name("app-dev").is_err());
        assert!(validate_database_name("x\"; DROP").is_err());
        assert!(validate_database_name("").is_err());
    }

    #[tokio::test]
    async fn test_sqlite_is_a_no_op() {
        let config = DaoConfig::parse("sqlite:/tmp/never-created.db").unwrap();
        assert!(!ensure_database(&config).await.unwrap());
    }

    #[tokio::test]
    async fn test_url_without_database_is_rejected() {
        let config = DaoConfig::parse("postgres://u:p@localhost:5432").unwrap();
        assert!(matches!(
            ensure_database(&config).await,
            Err(DbError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_postgres_database_if_configured() {
        let Ok(url) = std::env::var("TEST_POSTGRES_URL") else {
            return;
        };
        let config = DaoConfig::parse(&url).unwrap();
        // Second call must tolerate the existing database
        ensure_database(&config).await.unwrap();
        assert!(!ensure_database(&config).await.unwrap());
    }
}
