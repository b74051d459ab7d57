#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sea_orm::sqlx::sqlite::SqlitePoolOptions;
use sea_orm::{ConnectionTrait, SqlxSqliteConnector};
use tenantry_db::manager::RelationalHandle;
use tenantry_db::{ConnectionManager, DataConfig, DbHandle, Engine, Executor, TenantId};

pub const SHOP_DDL: &[&str] = &[
    "CREATE TABLE products (id INTEGER PRIMARY KEY AUTOINCREMENT, userId TEXT NOT NULL, name TEXT NOT NULL, price REAL)",
    "CREATE TABLE sales (id INTEGER PRIMARY KEY AUTOINCREMENT, userId TEXT NOT NULL, invoiceNumber TEXT NOT NULL, amount REAL, createdAt TEXT)",
    "CREATE TABLE settings (id INTEGER PRIMARY KEY AUTOINCREMENT, userId TEXT NOT NULL, key TEXT NOT NULL, value TEXT)",
    "CREATE TABLE customers (id INTEGER PRIMARY KEY AUTOINCREMENT, userId TEXT NOT NULL, email TEXT NOT NULL)",
    "CREATE TABLE suppliers (id INTEGER PRIMARY KEY AUTOINCREMENT, userId TEXT NOT NULL, name TEXT NOT NULL)",
    "CREATE TABLE categories (id INTEGER PRIMARY KEY AUTOINCREMENT, userId TEXT NOT NULL, name TEXT NOT NULL)",
    "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, email TEXT NOT NULL, username TEXT NOT NULL)",
];

/// In-memory SQLite shop, labelled as `PostgreSQL` for error reporting.
/// A single connection keeps every statement on the same memory database.
pub async fn sqlite_shop() -> Result<DbHandle> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .connect("sqlite::memory:")
        .await?;
    let conn = SqlxSqliteConnector::from_sqlx_sqlite_pool(pool);
    for ddl in SHOP_DDL {
        conn.execute_unprepared(ddl).await?;
    }
    Ok(DbHandle::Relational(RelationalHandle::new(
        Engine::Postgres,
        conn,
    )))
}

pub fn executor(config: DataConfig) -> Executor {
    let manager = Arc::new(ConnectionManager::new(config.clone()));
    Executor::new(manager, config)
}

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

/// Waits until a TCP port accepts connections.
pub async fn wait_for_tcp(host: &str, port: u16, timeout: Duration) -> Result<()> {
    use tokio::net::TcpStream;
    use tokio::time::{Instant, sleep};

    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect((host, port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            anyhow::bail!("Timeout waiting for {host}:{port}");
        }
        sleep(Duration::from_millis(200)).await;
    }
}
