//! SQLite persistence store.
//!
//! Reads run concurrently on the pool; every write is serialized through a
//! single writer task with a bounded request channel (see [`writer`]), which
//! keeps SQLite happy and gives the correlator insert-or-replace semantics
//! without lock contention.

mod writer;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, oneshot};

use crate::calls::{Call, SystemType};
use crate::error::{TrunklineError, TrunklineResult};
use crate::protocol_constants::DB_WRITER_CHANNEL_CAPACITY;
use writer::WriteRequest;

/// Catalog row for a trunked talkgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkgroupRow {
    pub id: u64,
    pub alpha_tag: String,
    pub description: String,
    pub group_name: String,
    pub group_tag: String,
    pub mode: String,
}

/// Catalog row for a conventional frequency-keyed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRow {
    pub id: i64,
    pub frequency: u64,
    pub alpha_tag: String,
    pub description: String,
    pub group_name: String,
    pub group_tag: String,
    pub mode: String,
    pub system_type: String,
}

/// Field set written when upserting catalog rows.
#[derive(Debug, Clone, Default)]
pub struct CatalogUpsert {
    pub alpha_tag: String,
    pub description: String,
    pub group_name: String,
    pub group_tag: String,
    pub mode: String,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS calls (
        id TEXT PRIMARY KEY,
        talkgroup_id INTEGER NOT NULL DEFAULT 0,
        frequency INTEGER NOT NULL,
        start_time INTEGER NOT NULL,
        stop_time INTEGER,
        duration REAL,
        emergency INTEGER NOT NULL DEFAULT 0,
        encrypted INTEGER NOT NULL DEFAULT 0,
        audio_file TEXT,
        audio_type TEXT,
        system_type TEXT NOT NULL,
        channel_id INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS call_sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        call_id TEXT NOT NULL,
        source_id INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        position REAL NOT NULL,
        emergency INTEGER NOT NULL DEFAULT 0,
        tag TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS talkgroups (
        id INTEGER PRIMARY KEY,
        alpha_tag TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        group_name TEXT NOT NULL DEFAULT '',
        group_tag TEXT NOT NULL DEFAULT '',
        mode TEXT NOT NULL DEFAULT '',
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        frequency INTEGER NOT NULL UNIQUE,
        alpha_tag TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        group_name TEXT NOT NULL DEFAULT '',
        group_tag TEXT NOT NULL DEFAULT '',
        mode TEXT NOT NULL DEFAULT '',
        system_type TEXT NOT NULL DEFAULT 'conventional',
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS system_config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_call_sources_call ON call_sources(call_id)",
    "CREATE INDEX IF NOT EXISTS idx_calls_start ON calls(start_time)",
];

const CONFIG_SEEDS: &[(&str, &str)] = &[("system_type", "p25"), ("system_short_name", "default")];

/// Handle to the persistence store.
pub struct Store {
    pool: SqlitePool,
    write_tx: mpsc::Sender<WriteRequest>,
}

impl Store {
    /// Opens (creating if missing) the SQLite file, applies the schema, seeds
    /// the config table and starts the writer task.
    pub async fn open(path: &Path) -> TrunklineResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::bootstrap(pool).await
    }

    /// Opens an in-memory store. Test use only; the writer task still runs so
    /// behavior matches the file-backed store.
    pub async fn open_in_memory() -> TrunklineResult<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // A single connection: each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::bootstrap(pool).await
    }

    async fn bootstrap(pool: SqlitePool) -> TrunklineResult<Self> {
        Self::init_schema(&pool).await?;

        let (write_tx, write_rx) = mpsc::channel(DB_WRITER_CHANNEL_CAPACITY);
        tokio::spawn(writer::run_writer(pool.clone(), write_rx));

        Ok(Self { pool, write_tx })
    }

    async fn init_schema(pool: &SqlitePool) -> TrunklineResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
        for (key, value) in CONFIG_SEEDS.iter().copied() {
            sqlx::query(
                "INSERT OR IGNORE INTO system_config (key, value, updated_at) VALUES (?, ?, ?)",
            )
            .bind(key)
            .bind(value)
            .bind(crate::utils::now_secs() as i64)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads (concurrent on the pool)
    // ─────────────────────────────────────────────────────────────────────

    /// Reads a `system_config` value.
    pub async fn config_value(&self, key: &str) -> TrunklineResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM system_config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    /// Resolves the configured system type; defaults to trunked.
    pub async fn system_type(&self) -> TrunklineResult<SystemType> {
        let value = self.config_value("system_type").await?;
        Ok(SystemType::from_config(value.as_deref().unwrap_or("p25")))
    }

    /// Looks up a talkgroup catalog row.
    pub async fn talkgroup(&self, id: u64) -> TrunklineResult<Option<TalkgroupRow>> {
        let row = sqlx::query(
            "SELECT id, alpha_tag, description, group_name, group_tag, mode
             FROM talkgroups WHERE id = ?",
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| TalkgroupRow {
            id: r.get::<i64, _>("id") as u64,
            alpha_tag: r.get("alpha_tag"),
            description: r.get("description"),
            group_name: r.get("group_name"),
            group_tag: r.get("group_tag"),
            mode: r.get("mode"),
        }))
    }

    /// Looks up a conventional channel row by frequency.
    pub async fn channel_by_frequency(&self, frequency: u64) -> TrunklineResult<Option<ChannelRow>> {
        let row = sqlx::query(
            "SELECT id, frequency, alpha_tag, description, group_name, group_tag, mode, system_type
             FROM channels WHERE frequency = ?",
        )
        .bind(frequency as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ChannelRow {
            id: r.get("id"),
            frequency: r.get::<i64, _>("frequency") as u64,
            alpha_tag: r.get("alpha_tag"),
            description: r.get("description"),
            group_name: r.get("group_name"),
            group_tag: r.get("group_tag"),
            mode: r.get("mode"),
            system_type: r.get("system_type"),
        }))
    }

    /// Number of persisted calls. Used by tests and the health surface.
    pub async fn call_count(&self) -> TrunklineResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM calls")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Fetches a persisted call's core columns by canonical ID.
    pub async fn call_row(
        &self,
        id: &str,
    ) -> TrunklineResult<Option<(String, i64, Option<i64>, Option<String>, String)>> {
        let row = sqlx::query(
            "SELECT id, talkgroup_id, channel_id, audio_file, system_type FROM calls WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            (
                r.get("id"),
                r.get("talkgroup_id"),
                r.get("channel_id"),
                r.get("audio_file"),
                r.get("system_type"),
            )
        }))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writes (serialized through the writer task)
    // ─────────────────────────────────────────────────────────────────────

    async fn write(&self, request: WriteRequest) -> TrunklineResult<()> {
        self.write_tx
            .send(request)
            .await
            .map_err(|_| TrunklineError::ChannelClosed("persistence writer"))
    }

    /// Inserts or refreshes a talkgroup catalog row.
    pub async fn upsert_talkgroup(&self, id: u64, meta: CatalogUpsert) -> TrunklineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.write(WriteRequest::UpsertTalkgroup { id, meta, reply })
            .await?;
        rx.await
            .map_err(|_| TrunklineError::ChannelClosed("persistence writer"))?
    }

    /// Returns the surrogate ID of the channel row for `frequency`, creating
    /// it if absent.
    pub async fn get_or_create_channel(
        &self,
        frequency: u64,
        meta: CatalogUpsert,
    ) -> TrunklineResult<i64> {
        let (reply, rx) = oneshot::channel();
        self.write(WriteRequest::GetOrCreateChannel {
            frequency,
            meta,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| TrunklineError::ChannelClosed("persistence writer"))?
    }

    /// Inserts (or replaces, keyed on canonical ID) a call and its sources in
    /// one transaction.
    pub async fn insert_call(&self, call: Call) -> TrunklineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.write(WriteRequest::InsertCall { call, reply }).await?;
        rx.await
            .map_err(|_| TrunklineError::ChannelClosed("persistence writer"))?
    }

    /// Writes a `system_config` value.
    pub async fn set_config(&self, key: &str, value: &str) -> TrunklineResult<()> {
        let (reply, rx) = oneshot::channel();
        self.write(WriteRequest::SetConfig {
            key: key.to_string(),
            value: value.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| TrunklineError::ChannelClosed("persistence writer"))?
    }

    /// Closes the store: the writer drains its queue, then the pool closes.
    ///
    /// Called last during shutdown.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.write(WriteRequest::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        self.pool.close().await;
        log::info!("[Store] Closed");
    }
}
