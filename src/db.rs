//! SQLite schemas and pool helpers for the article store.
//!
//! The store is split across several database files under the node's data
//! root — `config.db`, `groups.db`, `peers.db`, `articles.db` and one
//! `groups/<hex-id>.db` per newsgroup. Every pool is owned by the store task;
//! nothing else touches these files.

use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// Applied to every database on open.
const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;";

/// Process-wide key/value configuration. Holds `deviceKey` among others.
pub const CREATE_CONFIG_DB: &str = "CREATE TABLE IF NOT EXISTS config (
    key TEXT NOT NULL UNIQUE,
    val BLOB
);";

/// Group id/name registry.
pub const CREATE_GROUPS_DB: &str = "CREATE TABLE IF NOT EXISTS groups (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);";

/// Known peers. The pubkey is recoverable from the torid; it is kept
/// denormalised so inbound auth does not need to re-derive it.
pub const CREATE_PEERS_DB: &str = "CREATE TABLE IF NOT EXISTS peers (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    torid TEXT NOT NULL UNIQUE,
    pubkey TEXT NOT NULL,
    name TEXT NOT NULL
);";

/// Global article table. `refs` counts group-index rows pointing at the
/// message-id; the blob on disk lives exactly as long as refs > 0.
pub const CREATE_ARTICLES_DB: &str = "CREATE TABLE IF NOT EXISTS articles (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    messageid TEXT NOT NULL UNIQUE,
    signature TEXT NOT NULL,
    refs INTEGER NOT NULL DEFAULT 0
);";

/// Per-group database: article index, peer subscriptions, key/value config
/// and the permissions table. The sentinel torid `group` row carries the
/// group's default permissions.
pub const CREATE_GROUP_INDEX_DB: &str = "CREATE TABLE IF NOT EXISTS articles (
    id INTEGER NOT NULL,
    messageid TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS subscriptions (
    groupname TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS config (
    key TEXT NOT NULL UNIQUE,
    val BLOB
);
CREATE TABLE IF NOT EXISTS perms (
    torid TEXT NOT NULL UNIQUE,
    read BOOLEAN DEFAULT FALSE,
    reply BOOLEAN DEFAULT FALSE,
    post BOOLEAN DEFAULT FALSE,
    cancel BOOLEAN DEFAULT FALSE,
    supersede BOOLEAN DEFAULT FALSE
);";

/// Open (creating if needed) a database file and apply its schema.
pub async fn open_db(path: &Path, schema: &str) -> Result<SqlitePool, sqlx::Error> {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await?;
    sqlx::query(PRAGMAS).execute(&pool).await?;
    sqlx::query(schema).execute(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.db");

        let pool = open_db(&path, CREATE_CONFIG_DB).await.unwrap();
        sqlx::query("INSERT INTO config(key, val) VALUES('k', 'v')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        // Second open must not clobber existing rows.
        let pool = open_db(&path, CREATE_CONFIG_DB).await.unwrap();
        let val: String = sqlx::query_scalar("SELECT val FROM config WHERE key='k'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(val, "v");
    }

    #[tokio::test]
    async fn group_index_schema_has_all_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_db(&dir.path().join("1.db"), CREATE_GROUP_INDEX_DB)
            .await
            .unwrap();
        for table in ["articles", "subscriptions", "config", "perms"] {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
