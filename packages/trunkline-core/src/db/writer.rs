//! Single-writer task for the persistence store.
//!
//! All mutations arrive on a bounded request channel and execute serially,
//! giving SQLite single-writer semantics without blocking readers. Each
//! request carries a oneshot reply so callers observe the outcome.

use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, oneshot};

use crate::calls::Call;
use crate::db::CatalogUpsert;
use crate::error::TrunklineResult;
use crate::utils::now_secs;

pub(crate) enum WriteRequest {
    UpsertTalkgroup {
        id: u64,
        meta: CatalogUpsert,
        reply: oneshot::Sender<TrunklineResult<()>>,
    },
    GetOrCreateChannel {
        frequency: u64,
        meta: CatalogUpsert,
        reply: oneshot::Sender<TrunklineResult<i64>>,
    },
    InsertCall {
        call: Call,
        reply: oneshot::Sender<TrunklineResult<()>>,
    },
    SetConfig {
        key: String,
        value: String,
        reply: oneshot::Sender<TrunklineResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) async fn run_writer(pool: SqlitePool, mut rx: mpsc::Receiver<WriteRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            WriteRequest::UpsertTalkgroup { id, meta, reply } => {
                let _ = reply.send(upsert_talkgroup(&pool, id, &meta).await);
            }
            WriteRequest::GetOrCreateChannel {
                frequency,
                meta,
                reply,
            } => {
                let _ = reply.send(get_or_create_channel(&pool, frequency, &meta).await);
            }
            WriteRequest::InsertCall { call, reply } => {
                let _ = reply.send(insert_call(&pool, &call).await);
            }
            WriteRequest::SetConfig { key, value, reply } => {
                let _ = reply.send(set_config(&pool, &key, &value).await);
            }
            WriteRequest::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
    log::debug!("[Store] Writer task stopped");
}

async fn upsert_talkgroup(pool: &SqlitePool, id: u64, meta: &CatalogUpsert) -> TrunklineResult<()> {
    sqlx::query(
        "INSERT INTO talkgroups (id, alpha_tag, description, group_name, group_tag, mode, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            alpha_tag = excluded.alpha_tag,
            description = excluded.description,
            group_name = excluded.group_name,
            group_tag = excluded.group_tag,
            mode = excluded.mode,
            updated_at = excluded.updated_at",
    )
    .bind(id as i64)
    .bind(&meta.alpha_tag)
    .bind(&meta.description)
    .bind(&meta.group_name)
    .bind(&meta.group_tag)
    .bind(&meta.mode)
    .bind(now_secs() as i64)
    .execute(pool)
    .await?;
    Ok(())
}

async fn get_or_create_channel(
    pool: &SqlitePool,
    frequency: u64,
    meta: &CatalogUpsert,
) -> TrunklineResult<i64> {
    sqlx::query(
        "INSERT INTO channels (frequency, alpha_tag, description, group_name, group_tag, mode,
                               system_type, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, 'conventional', ?)
         ON CONFLICT(frequency) DO NOTHING",
    )
    .bind(frequency as i64)
    .bind(&meta.alpha_tag)
    .bind(&meta.description)
    .bind(&meta.group_name)
    .bind(&meta.group_tag)
    .bind(&meta.mode)
    .bind(now_secs() as i64)
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT id FROM channels WHERE frequency = ?")
        .bind(frequency as i64)
        .fetch_one(pool)
        .await?;
    Ok(row.get::<i64, _>("id"))
}

async fn insert_call(pool: &SqlitePool, call: &Call) -> TrunklineResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT OR REPLACE INTO calls
            (id, talkgroup_id, frequency, start_time, stop_time, duration, emergency, encrypted,
             audio_file, audio_type, system_type, channel_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&call.id)
    .bind(call.talkgroup_id as i64)
    .bind(call.frequency as i64)
    .bind(call.start_time as i64)
    .bind(call.stop_time.map(|t| t as i64))
    .bind(call.duration)
    .bind(call.emergency as i64)
    .bind(call.encrypted as i64)
    .bind(call.audio_file.as_deref())
    .bind(call.audio_type.as_deref())
    .bind(call.system_type.as_str())
    .bind(call.channel_id)
    .bind(now_secs() as i64)
    .execute(&mut *tx)
    .await?;

    // Replacing a call replaces its source list wholesale.
    sqlx::query("DELETE FROM call_sources WHERE call_id = ?")
        .bind(&call.id)
        .execute(&mut *tx)
        .await?;

    for source in &call.sources {
        sqlx::query(
            "INSERT INTO call_sources (call_id, source_id, timestamp, position, emergency, tag)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&call.id)
        .bind(source.source_id as i64)
        .bind(source.timestamp as i64)
        .bind(source.position)
        .bind(source.emergency as i64)
        .bind(&source.tag)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn set_config(pool: &SqlitePool, key: &str, value: &str) -> TrunklineResult<()> {
    sqlx::query(
        "INSERT INTO system_config (key, value, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(now_secs() as i64)
    .execute(pool)
    .await?;
    Ok(())
}
