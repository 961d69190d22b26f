//! The article store: a single-writer task owning every database pool and the
//! on-disk article blobs.
//!
//! All public operations go through the [`Store`] handle, which enqueues a
//! typed request on a bounded channel and waits on a oneshot reply. Exactly
//! one task mutates store state, which is what enforces the ref-count and
//! index/blob invariants; callers never observe a half-applied operation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::db;
use crate::keys::{pubkey_from_onion, NodeKey};
use crate::message::{CodecError, Message, SIGNATURE_HEADER};
use crate::nntp::{Article, Group, PostingStatus};

/// Config key holding the raw 64-byte onion private key.
pub const DEVICE_KEY: &str = "deviceKey";

const COMMAND_QUEUE_DEPTH: usize = 32;

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("not permitted: {0}")]
    NotPermitted(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("store task is gone")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupPermissions {
    pub read: bool,
    pub reply: bool,
    pub post: bool,
    pub cancel: bool,
    pub supersede: bool,
}

impl GroupPermissions {
    pub fn all() -> Self {
        GroupPermissions { read: true, reply: true, post: true, cancel: true, supersede: true }
    }
}

/// One permissions row extracted from a group-creation vCard.
#[derive(Debug, Clone)]
pub struct PermEntry {
    pub torid: String,
    pub perms: GroupPermissions,
}

/// Typed value for the key/value config relations.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    Text(String),
    Int(i64),
    Bytes(Vec<u8>),
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::Text(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<Vec<u8>> for ConfigValue {
    fn from(v: Vec<u8>) -> Self {
        ConfigValue::Bytes(v)
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<T>;

enum StoreRequest {
    GetPerms { torid: String, group: String, reply: Reply<Option<GroupPermissions>> },
    NewGroup { name: String, description: String, flags: String, perms: Vec<PermEntry>, reply: Reply<Result<(), StoreError>> },
    GetArticleBySignature { signature: String, reply: Reply<Result<Article, StoreError>> },
    GetArticleById { id: String, reply: Reply<Result<Article, StoreError>> },
    CancelMessage { from: String, msgid: String, newsgroups: Vec<String>, reply: Reply<Result<Vec<String>, StoreError>> },
    ConfigSet { key: String, val: ConfigValue, reply: Reply<Result<(), StoreError>> },
    ConfigGetString { key: String, reply: Reply<Result<String, StoreError>> },
    ConfigGetInt64 { key: String, reply: Reply<Result<i64, StoreError>> },
    ConfigGetBytes { key: String, reply: Reply<Result<Vec<u8>, StoreError>> },
    ListGroups { session_id: String, reply: Reply<Result<Vec<Group>, StoreError>> },
    GetGroup { session_id: String, name: String, reply: Reply<Result<Group, StoreError>> },
    ListArticles { group: String, from: i64, to: i64, reply: Reply<Result<Vec<i64>, StoreError>> },
    GetGroupNumber { group: String, reply: Reply<Result<i64, StoreError>> },
    StoreArticle { msg: Box<Message>, reply: Reply<Result<i64, StoreError>> },
    AddArticleToGroup { group: String, messageid: String, article_id: i64, reply: Reply<Result<i64, StoreError>> },
    AddPeer { torid: String, reply: Reply<Result<(), StoreError>> },
    RemovePeerRow { torid: String, reply: Reply<Result<(), StoreError>> },
    GetPeerList { reply: Reply<Result<Vec<String>, StoreError>> },
    GroupConfigSet { group: String, key: String, val: ConfigValue, reply: Reply<Result<(), StoreError>> },
    GroupConfigGetInt64 { group: String, key: String, reply: Reply<Result<i64, StoreError>> },
    GroupSubscriptions { group: String, reply: Reply<Result<Vec<String>, StoreError>> },
    GroupUpdateSubscriptions { group: String, list: Vec<String>, reply: Reply<Result<(), StoreError>> },
    GetNextArticle { last: i64, reply: Reply<Result<Option<(i64, Article)>, StoreError>> },
}

// ─── Handle ───────────────────────────────────────────────────────────────────

/// Clonable handle to the store task.
#[derive(Clone)]
pub struct Store {
    tx: mpsc::Sender<StoreRequest>,
}

impl Store {
    /// Open every database under `path` and spawn the store task.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Store, StoreError> {
        let path = path.into();
        tokio::fs::create_dir_all(path.join("groups")).await?;
        tokio::fs::create_dir_all(path.join("articles")).await?;

        let mut task = StoreTask::open(&path).await?;
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        tokio::spawn(async move { task.run(rx).await });
        Ok(Store { tx })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Effective permissions of `torid` on `group`. The group's owner gets
    /// everything; an unknown group yields an all-false record so listings
    /// skip it; `None` means the lookup itself failed.
    pub async fn get_perms(&self, torid: &str, group: &str) -> Option<GroupPermissions> {
        let torid = torid.to_string();
        let group = group.to_string();
        self.request(|reply| StoreRequest::GetPerms { torid, group, reply })
            .await
            .unwrap_or(None)
    }

    pub async fn new_group(
        &self,
        name: &str,
        description: &str,
        flags: &str,
        perms: Vec<PermEntry>,
    ) -> Result<(), StoreError> {
        let (name, description, flags) = (name.to_string(), description.to_string(), flags.to_string());
        self.request(|reply| StoreRequest::NewGroup { name, description, flags, perms, reply })
            .await?
    }

    pub async fn get_article_by_signature(&self, signature: &str) -> Result<Article, StoreError> {
        let signature = signature.to_string();
        self.request(|reply| StoreRequest::GetArticleBySignature { signature, reply }).await?
    }

    /// Fetch by global article number (numeric) or message-id.
    pub async fn get_article_by_id(&self, id: &str) -> Result<Article, StoreError> {
        let id = id.to_string();
        self.request(|reply| StoreRequest::GetArticleById { id, reply }).await?
    }

    /// Cancel `msgid` out of `newsgroups`. Returns the ids of peers whose
    /// pair-groups were cancelled, so the caller can tear the peering down.
    pub async fn cancel_message(
        &self,
        from: &str,
        msgid: &str,
        newsgroups: Vec<String>,
    ) -> Result<Vec<String>, StoreError> {
        let (from, msgid) = (from.to_string(), msgid.to_string());
        self.request(|reply| StoreRequest::CancelMessage { from, msgid, newsgroups, reply }).await?
    }

    pub async fn config_set(&self, key: &str, val: impl Into<ConfigValue>) -> Result<(), StoreError> {
        let (key, val) = (key.to_string(), val.into());
        self.request(|reply| StoreRequest::ConfigSet { key, val, reply }).await?
    }

    pub async fn config_get_string(&self, key: &str) -> Result<String, StoreError> {
        let key = key.to_string();
        self.request(|reply| StoreRequest::ConfigGetString { key, reply }).await?
    }

    pub async fn config_get_i64(&self, key: &str) -> Result<i64, StoreError> {
        let key = key.to_string();
        self.request(|reply| StoreRequest::ConfigGetInt64 { key, reply }).await?
    }

    pub async fn config_get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let key = key.to_string();
        self.request(|reply| StoreRequest::ConfigGetBytes { key, reply }).await?
    }

    /// Groups readable by `session_id`.
    pub async fn list_groups(&self, session_id: &str) -> Result<Vec<Group>, StoreError> {
        let session_id = session_id.to_string();
        self.request(|reply| StoreRequest::ListGroups { session_id, reply }).await?
    }

    pub async fn get_group(&self, session_id: &str, name: &str) -> Result<Group, StoreError> {
        let (session_id, name) = (session_id.to_string(), name.to_string());
        self.request(|reply| StoreRequest::GetGroup { session_id, name, reply }).await?
    }

    /// Article numbers in `[min(from,to), max(from,to)]`, ascending.
    pub async fn list_articles(&self, group: &str, from: i64, to: i64) -> Result<Vec<i64>, StoreError> {
        let group = group.to_string();
        self.request(|reply| StoreRequest::ListArticles { group, from, to, reply }).await?
    }

    pub async fn get_group_number(&self, group: &str) -> Result<i64, StoreError> {
        let group = group.to_string();
        self.request(|reply| StoreRequest::GetGroupNumber { group, reply }).await?
    }

    /// Insert the article row with `refs = 0` and write its blob. Returns the
    /// new global article id.
    pub async fn store_article(&self, msg: &Message) -> Result<i64, StoreError> {
        let msg = Box::new(msg.clone());
        self.request(|reply| StoreRequest::StoreArticle { msg, reply }).await?
    }

    /// Add an index row and bump the ref-count. Returns the new count.
    pub async fn add_article_to_group(
        &self,
        group: &str,
        messageid: &str,
        article_id: i64,
    ) -> Result<i64, StoreError> {
        let (group, messageid) = (group.to_string(), messageid.to_string());
        self.request(|reply| StoreRequest::AddArticleToGroup { group, messageid, article_id, reply })
            .await?
    }

    /// Persist a peer row and initialise its pair-group cursor and feed
    /// config. The pair-group itself must already exist.
    pub async fn add_peer(&self, torid: &str) -> Result<(), StoreError> {
        let torid = torid.to_string();
        self.request(|reply| StoreRequest::AddPeer { torid, reply }).await?
    }

    pub async fn remove_peer_row(&self, torid: &str) -> Result<(), StoreError> {
        let torid = torid.to_string();
        self.request(|reply| StoreRequest::RemovePeerRow { torid, reply }).await?
    }

    pub async fn get_peer_list(&self) -> Result<Vec<String>, StoreError> {
        self.request(|reply| StoreRequest::GetPeerList { reply }).await?
    }

    pub async fn group_config_set(
        &self,
        group: &str,
        key: &str,
        val: impl Into<ConfigValue>,
    ) -> Result<(), StoreError> {
        let (group, key, val) = (group.to_string(), key.to_string(), val.into());
        self.request(|reply| StoreRequest::GroupConfigSet { group, key, val, reply }).await?
    }

    pub async fn group_config_get_i64(&self, group: &str, key: &str) -> Result<i64, StoreError> {
        let (group, key) = (group.to_string(), key.to_string());
        self.request(|reply| StoreRequest::GroupConfigGetInt64 { group, key, reply }).await?
    }

    pub async fn group_subscriptions(&self, group: &str) -> Result<Vec<String>, StoreError> {
        let group = group.to_string();
        self.request(|reply| StoreRequest::GroupSubscriptions { group, reply }).await?
    }

    /// Replace the subscription set wholesale.
    pub async fn group_update_subscriptions(
        &self,
        group: &str,
        list: Vec<String>,
    ) -> Result<(), StoreError> {
        let group = group.to_string();
        self.request(|reply| StoreRequest::GroupUpdateSubscriptions { group, list, reply }).await?
    }

    /// First article with id greater than `last`, or `None`.
    pub async fn get_next_article(&self, last: i64) -> Result<Option<(i64, Article)>, StoreError> {
        self.request(|reply| StoreRequest::GetNextArticle { last, reply }).await?
    }
}

// ─── Task ─────────────────────────────────────────────────────────────────────

struct StoreTask {
    path: PathBuf,
    articles: SqlitePool,
    config: SqlitePool,
    groups: SqlitePool,
    peers: SqlitePool,
    group_dbs: HashMap<String, SqlitePool>,
    group_ids: HashMap<String, i64>,
}

impl StoreTask {
    async fn open(path: &Path) -> Result<StoreTask, StoreError> {
        let mut task = StoreTask {
            path: path.to_path_buf(),
            articles: db::open_db(&path.join("articles.db"), db::CREATE_ARTICLES_DB).await?,
            config: db::open_db(&path.join("config.db"), db::CREATE_CONFIG_DB).await?,
            groups: db::open_db(&path.join("groups.db"), db::CREATE_GROUPS_DB).await?,
            peers: db::open_db(&path.join("peers.db"), db::CREATE_PEERS_DB).await?,
            group_dbs: HashMap::new(),
            group_ids: HashMap::new(),
        };
        task.open_groups().await?;
        Ok(task)
    }

    async fn open_groups(&mut self) -> Result<(), StoreError> {
        let rows = sqlx::query("SELECT id, name FROM groups")
            .fetch_all(&self.groups)
            .await?;
        for row in rows {
            let id: i64 = row.get("id");
            let name: String = row.get("name");
            let pool = db::open_db(&self.group_db_path(id), db::CREATE_GROUP_INDEX_DB).await?;
            log::debug!("opened group db: {name} ({id:x})");
            self.group_dbs.insert(name.clone(), pool);
            self.group_ids.insert(name, id);
        }
        Ok(())
    }

    fn group_db_path(&self, id: i64) -> PathBuf {
        self.path.join("groups").join(format!("{id:x}.db"))
    }

    fn blob_path(&self, signature: &str) -> PathBuf {
        self.path.join("articles").join(signature)
    }

    async fn run(&mut self, mut rx: mpsc::Receiver<StoreRequest>) {
        while let Some(req) = rx.recv().await {
            match req {
                StoreRequest::GetPerms { torid, group, reply } => {
                    let _ = reply.send(self.get_perms(&torid, &group).await);
                }
                StoreRequest::NewGroup { name, description, flags, perms, reply } => {
                    let _ = reply.send(self.new_group(&name, &description, &flags, &perms).await);
                }
                StoreRequest::GetArticleBySignature { signature, reply } => {
                    let _ = reply.send(self.get_article_by_signature(&signature).await);
                }
                StoreRequest::GetArticleById { id, reply } => {
                    let _ = reply.send(self.get_article_by_id(&id).await);
                }
                StoreRequest::CancelMessage { from, msgid, newsgroups, reply } => {
                    let _ = reply.send(self.cancel_message(&from, &msgid, &newsgroups).await);
                }
                StoreRequest::ConfigSet { key, val, reply } => {
                    let _ = reply.send(self.kv_set(&self.config.clone(), &key, &val).await);
                }
                StoreRequest::ConfigGetString { key, reply } => {
                    let _ = reply.send(self.kv_get::<String>(&self.config.clone(), &key).await);
                }
                StoreRequest::ConfigGetInt64 { key, reply } => {
                    let _ = reply.send(self.kv_get::<i64>(&self.config.clone(), &key).await);
                }
                StoreRequest::ConfigGetBytes { key, reply } => {
                    let _ = reply.send(self.kv_get::<Vec<u8>>(&self.config.clone(), &key).await);
                }
                StoreRequest::ListGroups { session_id, reply } => {
                    let _ = reply.send(self.list_groups(&session_id).await);
                }
                StoreRequest::GetGroup { session_id, name, reply } => {
                    let _ = reply.send(self.get_group(&session_id, &name).await);
                }
                StoreRequest::ListArticles { group, from, to, reply } => {
                    let _ = reply.send(self.list_articles(&group, from, to).await);
                }
                StoreRequest::GetGroupNumber { group, reply } => {
                    let _ = reply.send(self.get_group_number(&group).await);
                }
                StoreRequest::StoreArticle { msg, reply } => {
                    let _ = reply.send(self.store_article(&msg).await);
                }
                StoreRequest::AddArticleToGroup { group, messageid, article_id, reply } => {
                    let _ = reply.send(self.add_article_to_group(&group, &messageid, article_id).await);
                }
                StoreRequest::AddPeer { torid, reply } => {
                    let _ = reply.send(self.add_peer(&torid).await);
                }
                StoreRequest::RemovePeerRow { torid, reply } => {
                    let _ = reply.send(self.remove_peer_row(&torid).await);
                }
                StoreRequest::GetPeerList { reply } => {
                    let _ = reply.send(self.get_peer_list().await);
                }
                StoreRequest::GroupConfigSet { group, key, val, reply } => {
                    let _ = reply.send(self.group_config_set(&group, &key, &val).await);
                }
                StoreRequest::GroupConfigGetInt64 { group, key, reply } => {
                    let _ = reply.send(self.group_config_get_i64(&group, &key).await);
                }
                StoreRequest::GroupSubscriptions { group, reply } => {
                    let _ = reply.send(self.group_subscriptions(&group).await);
                }
                StoreRequest::GroupUpdateSubscriptions { group, list, reply } => {
                    let _ = reply.send(self.group_update_subscriptions(&group, &list).await);
                }
                StoreRequest::GetNextArticle { last, reply } => {
                    let _ = reply.send(self.get_next_article(last).await);
                }
            }
        }
    }

    // ── Permissions ───────────────────────────────────────────────────────────

    async fn get_perms(&self, torid: &str, group: &str) -> Option<GroupPermissions> {
        if group.split('.').next() == Some(torid) {
            return Some(GroupPermissions::all());
        }
        let Some(pool) = self.group_dbs.get(group) else {
            // Unknown group: visible as "no access" rather than an error, so
            // listings skip it gracefully.
            return Some(GroupPermissions::default());
        };
        match Self::perm_row(pool, torid).await {
            Ok(Some(perms)) => Some(perms),
            Ok(None) => match Self::perm_row(pool, "group").await {
                Ok(Some(perms)) => Some(perms),
                Ok(None) => {
                    log::warn!("no default permissions for group {group}");
                    None
                }
                Err(err) => {
                    log::error!("default permission lookup failed for {group}: {err}");
                    None
                }
            },
            Err(err) => {
                log::error!("permission lookup failed for {torid} on {group}: {err}");
                None
            }
        }
    }

    async fn perm_row(pool: &SqlitePool, torid: &str) -> Result<Option<GroupPermissions>, sqlx::Error> {
        let row = sqlx::query("SELECT read, reply, post, cancel, supersede FROM perms WHERE torid = ?")
            .bind(torid)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(|r| GroupPermissions {
            read: r.get("read"),
            reply: r.get("reply"),
            post: r.get("post"),
            cancel: r.get("cancel"),
            supersede: r.get("supersede"),
        }))
    }

    // ── Groups ────────────────────────────────────────────────────────────────

    async fn new_group(
        &mut self,
        name: &str,
        description: &str,
        flags: &str,
        perms: &[PermEntry],
    ) -> Result<(), StoreError> {
        let res = sqlx::query("INSERT INTO groups(name) VALUES (?)")
            .bind(name)
            .execute(&self.groups)
            .await;
        let res = match res {
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::AlreadyExists)
            }
            other => other?,
        };
        let group_id = res.last_insert_rowid();

        let pool = db::open_db(&self.group_db_path(group_id), db::CREATE_GROUP_INDEX_DB).await?;
        self.kv_set(&pool, "description", &ConfigValue::Text(description.to_string())).await?;
        self.kv_set(&pool, "flags", &ConfigValue::Text(flags.to_string())).await?;
        for entry in perms {
            sqlx::query(
                "INSERT INTO perms (torid, read, reply, post, cancel, supersede) VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(torid) DO UPDATE SET
                     read = excluded.read,
                     reply = excluded.reply,
                     post = excluded.post,
                     cancel = excluded.cancel,
                     supersede = excluded.supersede",
            )
            .bind(&entry.torid)
            .bind(entry.perms.read)
            .bind(entry.perms.reply)
            .bind(entry.perms.post)
            .bind(entry.perms.cancel)
            .bind(entry.perms.supersede)
            .execute(&pool)
            .await?;
        }

        log::info!("created group {name} ({group_id:x})");
        self.group_dbs.insert(name.to_string(), pool);
        self.group_ids.insert(name.to_string(), group_id);
        Ok(())
    }

    async fn list_groups(&self, session_id: &str) -> Result<Vec<Group>, StoreError> {
        let rows = sqlx::query("SELECT name FROM groups ORDER BY id")
            .fetch_all(&self.groups)
            .await?;
        let mut out = Vec::new();
        for row in rows {
            let name: String = row.get("name");
            let Some(perms) = self.get_perms(session_id, &name).await else { continue };
            if !perms.read {
                continue;
            }
            match self.group_stats(&name).await {
                Ok(group) => out.push(group),
                Err(err) => log::warn!("skipping group {name} in listing: {err}"),
            }
        }
        Ok(out)
    }

    async fn get_group(&self, session_id: &str, name: &str) -> Result<Group, StoreError> {
        match self.get_perms(session_id, name).await {
            Some(perms) if perms.read => self.group_stats(name).await,
            _ => Err(StoreError::NotFound),
        }
    }

    async fn group_stats(&self, name: &str) -> Result<Group, StoreError> {
        let pool = self.group_dbs.get(name).ok_or(StoreError::NotFound)?;
        let description = self.kv_get::<String>(pool, "description").await.unwrap_or_default();
        let flags = self.kv_get::<String>(pool, "flags").await.unwrap_or_else(|_| "y".to_string());

        let row = sqlx::query(
            "SELECT
                COALESCE((SELECT id FROM articles ORDER BY id DESC LIMIT 1), 0) AS high,
                COALESCE((SELECT id FROM articles ORDER BY id ASC LIMIT 1), 0) AS low,
                COALESCE((SELECT COUNT(id) FROM articles), 0) AS total",
        )
        .fetch_one(pool)
        .await?;

        Ok(Group {
            name: name.to_string(),
            description,
            count: row.get("total"),
            low: row.get("low"),
            high: row.get("high"),
            posting: PostingStatus::from_flag(&flags),
        })
    }

    async fn list_articles(&self, group: &str, from: i64, to: i64) -> Result<Vec<i64>, StoreError> {
        let (from, to) = (from.min(to), from.max(to));
        let pool = self.group_dbs.get(group).ok_or(StoreError::NotFound)?;
        let rows = sqlx::query("SELECT id FROM articles WHERE id >= ? AND id <= ? ORDER BY id ASC")
            .bind(from)
            .bind(to)
            .fetch_all(pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn get_group_number(&self, group: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT id FROM groups WHERE name = ?")
            .bind(group)
            .fetch_optional(&self.groups)
            .await?;
        row.map(|r| r.get("id")).ok_or(StoreError::NotFound)
    }

    // ── Articles ──────────────────────────────────────────────────────────────

    async fn get_article_by_signature(&self, signature: &str) -> Result<Article, StoreError> {
        let raw = tokio::fs::read_to_string(self.blob_path(signature)).await?;
        Ok(Article::parse(&raw)?)
    }

    async fn get_article_by_id(&self, id: &str) -> Result<Article, StoreError> {
        let row = if id.parse::<i64>().is_ok() {
            sqlx::query("SELECT signature FROM articles WHERE id = ?")
                .bind(id.parse::<i64>().expect("checked above"))
                .fetch_optional(&self.articles)
                .await?
        } else {
            sqlx::query("SELECT signature FROM articles WHERE messageid = ?")
                .bind(id)
                .fetch_optional(&self.articles)
                .await?
        };
        let signature: String = row.map(|r| r.get("signature")).ok_or(StoreError::NotFound)?;
        self.get_article_by_signature(&signature).await
    }

    async fn store_article(&self, msg: &Message) -> Result<i64, StoreError> {
        let signature = msg
            .signature()
            .ok_or_else(|| StoreError::NotPermitted("article is not signed".into()))?
            .to_string();
        let messageid = msg
            .headers
            .get("Message-Id")
            .ok_or_else(|| StoreError::NotPermitted("article has no message-id".into()))?
            .to_string();

        let res = sqlx::query("INSERT INTO articles(messageid, signature, refs) VALUES (?, ?, 0)")
            .bind(&messageid)
            .bind(&signature)
            .execute(&self.articles)
            .await;
        let res = match res {
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::AlreadyExists)
            }
            other => other?,
        };
        let article_id = res.last_insert_rowid();

        if let Err(err) = tokio::fs::write(self.blob_path(&signature), msg.to_wire()).await {
            // Roll the row back so the index never points at a missing blob.
            let _ = sqlx::query("DELETE FROM articles WHERE messageid = ?")
                .bind(&messageid)
                .execute(&self.articles)
                .await;
            return Err(err.into());
        }
        Ok(article_id)
    }

    async fn add_article_to_group(
        &self,
        group: &str,
        messageid: &str,
        article_id: i64,
    ) -> Result<i64, StoreError> {
        let pool = self.group_dbs.get(group).ok_or(StoreError::NotFound)?;
        let res = sqlx::query("INSERT INTO articles(id, messageid) VALUES (?, ?)")
            .bind(article_id)
            .bind(messageid)
            .execute(pool)
            .await;
        match res {
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::AlreadyExists)
            }
            other => other?,
        };

        let refs: i64 =
            sqlx::query_scalar("UPDATE articles SET refs = refs + 1 WHERE messageid = ? RETURNING refs")
                .bind(messageid)
                .fetch_one(&self.articles)
                .await?;
        Ok(refs)
    }

    async fn cancel_message(
        &self,
        from: &str,
        msgid: &str,
        newsgroups: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let article = self.get_article_by_id(msgid).await?;
        if article.headers.get("From") != Some(from) {
            return Err(StoreError::NotPermitted(format!(
                "cancel from {from} does not match article author"
            )));
        }
        let signature = article
            .headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| StoreError::NotPermitted("stored article has no signature".into()))?
            .to_string();

        let msg = Message::from_headers_body(article.headers.clone(), "")?;
        let article_groups = msg.newsgroups();

        let mut removed_peers = Vec::new();
        for group in newsgroups {
            if !article_groups.iter().any(|g| g == group) {
                continue;
            }
            let Some(pool) = self.group_dbs.get(group) else { continue };

            // Cancelling the article that binds a pair-group tears the
            // peering down with it.
            let parts: Vec<&str> = group.split('.').collect();
            if parts.len() == 3 && parts[1] == "peers" {
                removed_peers.push(parts[2].to_string());
            }

            sqlx::query("DELETE FROM articles WHERE messageid = ?")
                .bind(msgid)
                .execute(pool)
                .await?;

            let refs: i64 = sqlx::query_scalar(
                "UPDATE articles SET refs = refs - 1 WHERE messageid = ? RETURNING refs",
            )
            .bind(msgid)
            .fetch_one(&self.articles)
            .await?;

            if refs == 0 {
                tokio::fs::remove_file(self.blob_path(&signature)).await?;
                sqlx::query("DELETE FROM articles WHERE messageid = ?")
                    .bind(msgid)
                    .execute(&self.articles)
                    .await?;
                log::info!("cancelled article {msgid}; blob {signature} removed");
                break;
            }
        }
        Ok(removed_peers)
    }

    async fn get_next_article(&self, last: i64) -> Result<Option<(i64, Article)>, StoreError> {
        let row = sqlx::query("SELECT id FROM articles WHERE id > ? ORDER BY id LIMIT 1")
            .bind(last)
            .fetch_optional(&self.articles)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let id: i64 = row.get("id");
        let article = self.get_article_by_id(&id.to_string()).await?;
        Ok(Some((id, article)))
    }

    // ── Peers ─────────────────────────────────────────────────────────────────

    async fn add_peer(&self, torid: &str) -> Result<(), StoreError> {
        let existing = sqlx::query("SELECT id FROM peers WHERE torid = ?")
            .bind(torid)
            .fetch_optional(&self.peers)
            .await?;
        if existing.is_some() {
            return Err(StoreError::AlreadyExists);
        }

        let device_key = self.kv_get::<Vec<u8>>(&self.config.clone(), DEVICE_KEY).await?;
        let key_bytes: [u8; 64] = device_key
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::NotPermitted("device key is corrupt".into()))?;
        let my_id = NodeKey::from_onion_private(&key_bytes).node_id();

        let group_name = format!("{my_id}.peers.{torid}");
        let pool = self.group_dbs.get(&group_name).ok_or(StoreError::NotFound)?.clone();
        self.kv_set(&pool, "ControlMessages", &ConfigValue::Text("true".into())).await?;
        self.kv_set(&pool, "Feed", &ConfigValue::Text(torid.to_string())).await?;
        self.kv_set(&pool, "LastMessage", &ConfigValue::Int(0)).await?;

        let pubkey = pubkey_from_onion(torid)
            .map_err(|err| StoreError::NotPermitted(format!("bad peer id {torid}: {err}")))?;
        sqlx::query("INSERT INTO peers(torid, pubkey, name) VALUES (?, ?, '')")
            .bind(torid)
            .bind(hex::encode(pubkey.as_bytes()))
            .execute(&self.peers)
            .await?;
        log::info!("added peer {torid}");
        Ok(())
    }

    async fn remove_peer_row(&self, torid: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM peers WHERE torid = ?")
            .bind(torid)
            .execute(&self.peers)
            .await?;
        log::info!("removed peer {torid}");
        Ok(())
    }

    async fn get_peer_list(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT torid FROM peers ORDER BY id")
            .fetch_all(&self.peers)
            .await?;
        Ok(rows.iter().map(|r| r.get("torid")).collect())
    }

    // ── Key/value config ──────────────────────────────────────────────────────

    async fn kv_set(&self, pool: &SqlitePool, key: &str, val: &ConfigValue) -> Result<(), StoreError> {
        let query = "INSERT INTO config (key, val) VALUES (?, ?)
                     ON CONFLICT(key) DO UPDATE SET val = excluded.val";
        let q = sqlx::query(query).bind(key);
        let q = match val {
            ConfigValue::Text(v) => q.bind(v.clone()),
            ConfigValue::Int(v) => q.bind(*v),
            ConfigValue::Bytes(v) => q.bind(v.clone()),
        };
        q.execute(pool).await?;
        Ok(())
    }

    async fn kv_get<T>(&self, pool: &SqlitePool, key: &str) -> Result<T, StoreError>
    where
        T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite> + Send + Unpin,
    {
        let row = sqlx::query("SELECT val FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
        match row {
            Some(r) => Ok(r.try_get::<T, _>("val")?),
            None => Err(StoreError::NotFound),
        }
    }

    async fn group_config_set(&self, group: &str, key: &str, val: &ConfigValue) -> Result<(), StoreError> {
        let pool = self.group_dbs.get(group).ok_or(StoreError::NotFound)?;
        self.kv_set(pool, key, val).await
    }

    async fn group_config_get_i64(&self, group: &str, key: &str) -> Result<i64, StoreError> {
        let pool = self.group_dbs.get(group).ok_or(StoreError::NotFound)?;
        self.kv_get::<i64>(pool, key).await
    }

    async fn group_subscriptions(&self, group: &str) -> Result<Vec<String>, StoreError> {
        let pool = self.group_dbs.get(group).ok_or(StoreError::NotFound)?;
        let rows = sqlx::query("SELECT groupname FROM subscriptions")
            .fetch_all(pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("groupname")).collect())
    }

    async fn group_update_subscriptions(&self, group: &str, list: &[String]) -> Result<(), StoreError> {
        let pool = self.group_dbs.get(group).ok_or(StoreError::NotFound)?;
        sqlx::query("DELETE FROM subscriptions").execute(pool).await?;
        for name in list {
            if name.is_empty() {
                continue;
            }
            sqlx::query("INSERT OR IGNORE INTO subscriptions(groupname) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await?;
        }
        Ok(())
    }
}
