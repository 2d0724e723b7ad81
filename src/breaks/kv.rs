//! KV fast-path store for active ad breaks.
//!
//! Holds an eventually-consistent projection of [`super::AdBreakState`] that
//! is sufficient to rewrite a manifest without entering the per-channel
//! serializer. Written by the serializer (on break open / skip binding) and
//! by the monitor loop; read by the request pipeline. Advisory only — the
//! serializer stays authoritative on conflict.

use crate::decision::DecisionResponse;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "valkey")]
use redis::aio::ConnectionManager;
#[cfg(feature = "valkey")]
use tracing::{error, info, warn};

/// Safety margin added to the break duration for the record TTL.
const TTL_MARGIN_SECS: u64 = 60;

/// SCTE-35 context carried in the projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scte35Meta {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_pdt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    #[serde(default)]
    pub tier: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_hex: Option<String>,
}

/// Projection of an active ad break.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdBreakRecord {
    pub channel_id: String,
    pub event_id: String,
    /// "scte35" | "manual" | "time"
    pub source: String,
    /// RFC3339.
    pub start_time: String,
    pub duration: f64,
    pub end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scte35: Option<Scte35Meta>,
    /// Written back by the serializer once the skip plan is bound, so the
    /// fast path replays the exact plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_skip_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_url: Option<String>,
}

impl AdBreakRecord {
    pub fn start_ms(&self) -> Option<i64> {
        chrono::DateTime::parse_from_rfc3339(&self.start_time)
            .ok()
            .map(|dt| dt.timestamp_millis())
    }

    pub fn end_ms(&self) -> Option<i64> {
        chrono::DateTime::parse_from_rfc3339(&self.end_time)
            .ok()
            .map(|dt| dt.timestamp_millis())
    }

    pub fn is_in_window(&self, now_ms: i64) -> bool {
        match (self.start_ms(), self.end_ms()) {
            (Some(start), Some(end)) => now_ms >= start - 1_000 && now_ms < end,
            _ => false,
        }
    }

    /// Stable pod id, derived the same way the state machine derives it.
    pub fn pod_id(&self) -> String {
        let secs = self.start_ms().unwrap_or(0).div_euclid(1000);
        format!("ad_{}_{}", self.channel_id, secs)
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.duration.ceil() as u64 + TTL_MARGIN_SECS)
    }
}

#[derive(Clone)]
enum Backend {
    Memory {
        entries: Arc<DashMap<String, (AdBreakRecord, Instant)>>,
    },
    #[cfg(feature = "valkey")]
    Valkey {
        conn: ConnectionManager,
        key_prefix: String,
    },
}

/// Ad-break KV store — same public API regardless of backend.
#[derive(Clone)]
pub struct AdBreakKv {
    backend: Backend,
}

fn event_key(channel_id: &str, event_id: &str) -> String {
    format!("adbreak:{}:{}", channel_id, event_id)
}

fn active_key(channel_id: &str) -> String {
    format!("adbreak:{}:active", channel_id)
}

impl AdBreakKv {
    /// In-memory store (default).
    pub fn new_memory() -> Self {
        Self {
            backend: Backend::Memory {
                entries: Arc::new(DashMap::new()),
            },
        }
    }

    /// Valkey-backed store.
    #[cfg(feature = "valkey")]
    pub async fn new_valkey(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Valkey at {}", url);
        Ok(Self {
            backend: Backend::Valkey {
                conn,
                key_prefix: "adedge".to_string(),
            },
        })
    }

    /// Stores the projection under both its event key and the channel's
    /// discoverable active key, TTL = duration + 60s.
    pub async fn put(&self, record: &AdBreakRecord) {
        let ttl = record.ttl();
        match &self.backend {
            Backend::Memory { entries } => {
                let expires = Instant::now() + ttl;
                entries.insert(
                    event_key(&record.channel_id, &record.event_id),
                    (record.clone(), expires),
                );
                entries.insert(active_key(&record.channel_id), (record.clone(), expires));
            }
            #[cfg(feature = "valkey")]
            Backend::Valkey { conn, key_prefix } => {
                let json = match serde_json::to_string(record) {
                    Ok(j) => j,
                    Err(e) => {
                        error!("Failed to serialize ad-break record: {}", e);
                        return;
                    }
                };
                let mut conn = conn.clone();
                for key in [
                    format!("{}:{}", key_prefix, event_key(&record.channel_id, &record.event_id)),
                    format!("{}:{}", key_prefix, active_key(&record.channel_id)),
                ] {
                    if let Err(e) = redis::cmd("SET")
                        .arg(&key)
                        .arg(&json)
                        .arg("EX")
                        .arg(ttl.as_secs())
                        .query_async::<()>(&mut conn)
                        .await
                    {
                        error!("Valkey SET failed for {}: {}", key, e);
                    }
                }
            }
        }
    }

    /// The channel's active break, when one is stored and still in window.
    pub async fn get_active(&self, channel_id: &str, now_ms: i64) -> Option<AdBreakRecord> {
        let record = self.get_raw(&active_key(channel_id)).await?;
        if record.is_in_window(now_ms) {
            Some(record)
        } else {
            None
        }
    }

    pub async fn get_event(&self, channel_id: &str, event_id: &str) -> Option<AdBreakRecord> {
        self.get_raw(&event_key(channel_id, event_id)).await
    }

    async fn get_raw(&self, key: &str) -> Option<AdBreakRecord> {
        match &self.backend {
            Backend::Memory { entries } => {
                if let Some(entry) = entries.get(key) {
                    let (record, expires) = entry.value();
                    if Instant::now() < *expires {
                        return Some(record.clone());
                    }
                    drop(entry);
                    entries.remove(key);
                }
                None
            }
            #[cfg(feature = "valkey")]
            Backend::Valkey { conn, key_prefix } => {
                let mut conn = conn.clone();
                let full_key = format!("{}:{}", key_prefix, key);
                match redis::cmd("GET")
                    .arg(&full_key)
                    .query_async::<Option<String>>(&mut conn)
                    .await
                {
                    Ok(Some(json)) => match serde_json::from_str(&json) {
                        Ok(record) => Some(record),
                        Err(e) => {
                            warn!("Undecodable ad-break record at {}: {}", full_key, e);
                            None
                        }
                    },
                    Ok(None) => None,
                    Err(e) => {
                        error!("Valkey GET failed for {}: {}", full_key, e);
                        None
                    }
                }
            }
        }
    }

    /// Drops the channel's active pointer (cue stop, break close).
    pub async fn clear_active(&self, channel_id: &str) {
        match &self.backend {
            Backend::Memory { entries } => {
                entries.remove(&active_key(channel_id));
            }
            #[cfg(feature = "valkey")]
            Backend::Valkey { conn, key_prefix } => {
                let mut conn = conn.clone();
                let key = format!("{}:{}", key_prefix, active_key(channel_id));
                if let Err(e) = redis::cmd("DEL")
                    .arg(&key)
                    .query_async::<()>(&mut conn)
                    .await
                {
                    error!("Valkey DEL failed for {}: {}", key, e);
                }
            }
        }
    }
}
