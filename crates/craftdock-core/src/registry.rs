//! Durable record store for accounts and server instances, backed by SQLite.
//! Name uniqueness is enforced by the storage layer, so racing creations of
//! the same name resolve to exactly one winner.

use std::str::FromStr;

use craftdock_common::{Error, Result};
use rand::distr::Alphanumeric;
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub type AccountId = i64;
pub type ServerId = i64;

const CONTROL_SECRET_LEN: usize = 24;
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerRecord {
    pub id: ServerId,
    pub name: String,
    pub memory_mb: u32,
    /// Remote-console secret for the instance. Generated here, never
    /// client-supplied.
    pub rcon_secret: String,
}

pub struct ServerRegistry {
    pool: SqlitePool,
}

impl ServerRegistry {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Single-connection in-memory store; every caller sees the same data,
    /// which is what tests need.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let registry = Self { pool };
        registry.init_schema().await?;
        Ok(registry)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                memory_mb INTEGER NOT NULL,
                rcon_secret TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS account_servers (
                account_id INTEGER NOT NULL,
                server_id INTEGER NOT NULL,
                PRIMARY KEY (account_id, server_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        info!("Registry schema ready");
        Ok(())
    }

    pub async fn create_account(&self, email: &str, password_hash: &str) -> Result<Account> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::Validation(format!("invalid email: {email}")));
        }
        let result = sqlx::query("INSERT INTO accounts (email, password_hash) VALUES (?1, ?2)")
            .bind(email)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| duplicate_or_storage(e, email))?;
        Ok(Account {
            id: result.last_insert_rowid(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
        })
    }

    /// Insert a server record plus its ownership row in one transaction. The
    /// unique constraint on `name` is the arbiter under concurrency, and the
    /// owner's memory quota is re-checked inside the same transaction so
    /// racing creates cannot both slip under it.
    pub async fn create_server(
        &self,
        name: &str,
        memory_mb: u32,
        owner: AccountId,
        quota_mb: u32,
    ) -> Result<ServerRecord> {
        validate_name(name)?;
        if memory_mb == 0 {
            return Err(Error::Validation(
                "memory allocation must be positive".to_string(),
            ));
        }

        let owner_exists: Option<i64> = sqlx::query_scalar("SELECT id FROM accounts WHERE id = ?1")
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        if owner_exists.is_none() {
            return Err(Error::NotFound(format!("no account {owner}")));
        }

        let rcon_secret = generate_control_secret();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("INSERT INTO servers (name, memory_mb, rcon_secret) VALUES (?1, ?2, ?3)")
            .bind(name)
            .bind(memory_mb)
            .bind(&rcon_secret)
            .execute(&mut *tx)
            .await
            .map_err(|e| duplicate_or_storage(e, name))?;
        let id = result.last_insert_rowid();
        sqlx::query("INSERT INTO account_servers (account_id, server_id) VALUES (?1, ?2)")
            .bind(owner)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        // The sum includes the row inserted above; exceeding the quota drops
        // the transaction, rolling both inserts back.
        let declared: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(servers.memory_mb)
             FROM servers
             INNER JOIN account_servers ON servers.id = account_servers.server_id
             WHERE account_servers.account_id = ?1",
        )
        .bind(owner)
        .fetch_one(&mut *tx)
        .await?;
        let declared = declared.unwrap_or(0);
        if declared > i64::from(quota_mb) {
            return Err(Error::Validation(format!(
                "allocation of {memory_mb} MB exceeds the {quota_mb} MB quota ({} MB already declared)",
                declared - i64::from(memory_mb)
            )));
        }
        tx.commit().await?;

        info!(%name, memory_mb, owner, "Created server record");
        Ok(ServerRecord {
            id,
            name: name.to_string(),
            memory_mb,
            rcon_secret,
        })
    }

    pub async fn list_by_owner(&self, owner: AccountId) -> Result<Vec<ServerRecord>> {
        let records = sqlx::query_as::<_, ServerRecord>(
            "SELECT servers.id, servers.name, servers.memory_mb, servers.rcon_secret
             FROM servers
             INNER JOIN account_servers ON servers.id = account_servers.server_id
             WHERE account_servers.account_id = ?1
             ORDER BY servers.name",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn get(&self, id: ServerId, owner: AccountId) -> Result<ServerRecord> {
        sqlx::query_as::<_, ServerRecord>(
            "SELECT servers.id, servers.name, servers.memory_mb, servers.rcon_secret
             FROM servers
             INNER JOIN account_servers ON servers.id = account_servers.server_id
             WHERE servers.id = ?1 AND account_servers.account_id = ?2",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no server {id}")))
    }

    pub async fn get_by_name(&self, name: &str, owner: AccountId) -> Result<ServerRecord> {
        sqlx::query_as::<_, ServerRecord>(
            "SELECT servers.id, servers.name, servers.memory_mb, servers.rcon_secret
             FROM servers
             INNER JOIN account_servers ON servers.id = account_servers.server_id
             WHERE servers.name = ?1 AND account_servers.account_id = ?2",
        )
        .bind(name)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("no server named {name}")))
    }

    pub async fn delete(&self, id: ServerId, owner: AccountId) -> Result<()> {
        // Owner-scoped lookup first so a foreign id reads as absent.
        let record = self.get(id, owner).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM account_servers WHERE server_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM servers WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(name = %record.name, id, "Deleted server record");
        Ok(())
    }

    pub async fn regenerate_secret(&self, id: ServerId, owner: AccountId) -> Result<ServerRecord> {
        let mut record = self.get(id, owner).await?;
        let rcon_secret = generate_control_secret();
        sqlx::query("UPDATE servers SET rcon_secret = ?1 WHERE id = ?2")
            .bind(&rcon_secret)
            .bind(id)
            .execute(&self.pool)
            .await?;
        record.rcon_secret = rcon_secret;
        Ok(record)
    }

    /// Every server name in the registry, all owners. Feeds orphan detection.
    pub async fn all_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM servers")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    /// Sum of declared memory across an owner's records, running or not.
    pub async fn declared_memory_for_owner(&self, owner: AccountId) -> Result<u32> {
        let total: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(servers.memory_mb)
             FROM servers
             INNER JOIN account_servers ON servers.id = account_servers.server_id
             WHERE account_servers.account_id = ?1",
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0).max(0) as u32)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "server name must be 1-{MAX_NAME_LEN} alphanumeric/dash characters: {name:?}"
        )))
    }
}

fn generate_control_secret() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(CONTROL_SECRET_LEN)
        .map(char::from)
        .collect()
}

fn duplicate_or_storage(err: sqlx::Error, name: &str) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::DuplicateName(name.to_string())
        }
        _ => Error::Storage(err),
    }
}
