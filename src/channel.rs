//! Channel configuration store.
//!
//! Channels are owned by the admin collaborator; this core only reads them.
//! The store is seeded once (JSON file via `CHANNELS_FILE`, or a dev default)
//! and serves lookups from memory. Detected bitrate ladders are the one piece
//! of state written back, and only in-memory — the admin surface owns
//! persistence.

use crate::config::Config;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Ad stitching mode for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    #[default]
    Auto,
    Ssai,
    Sgai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Active,
    Inactive,
}

fn default_true() -> bool {
    true
}

/// One channel row, as exposed by the persistent channel store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub org_slug: String,
    pub slug: String,
    pub origin_url: String,
    #[serde(default)]
    pub ad_pod_base_url: Option<String>,
    #[serde(default)]
    pub sign_host: Option<String>,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub mode: ChannelMode,
    /// SCTE-35 routing tier; 0 matches any signal tier.
    #[serde(default)]
    pub tier: u16,
    #[serde(default = "default_true")]
    pub scte35_auto_insert: bool,
    #[serde(default)]
    pub time_based_auto_insert: bool,
    #[serde(default)]
    pub slate_url: Option<String>,
    /// Configured bitrate ladder in kbps.
    #[serde(default)]
    pub bitrate_ladder: Vec<u64>,
    #[serde(default)]
    pub segment_cache_max_age: Option<u64>,
    #[serde(default)]
    pub manifest_cache_max_age: Option<u64>,
}

impl ChannelConfig {
    /// Absolute URL of a variant (or segment) under this channel's origin.
    pub fn variant_url(&self, variant: &str) -> String {
        format!("{}/{}", self.origin_url.trim_end_matches('/'), variant)
    }

    /// Deterministic mid-tier variant the monitor polls. Convention:
    /// `{kbps}.m3u8` under the origin base.
    pub fn mid_tier_variant(&self, detected: Option<&Vec<u64>>) -> String {
        let ladder = if !self.bitrate_ladder.is_empty() {
            &self.bitrate_ladder
        } else if let Some(d) = detected.filter(|d| !d.is_empty()) {
            d
        } else {
            return "playlist.m3u8".to_string();
        };
        format!("{}.m3u8", ladder[ladder.len() / 2])
    }
}

/// Read-only channel lookup with in-memory detected-bitrate write-back.
pub struct ChannelStore {
    by_slug: DashMap<String, Arc<ChannelConfig>>,
    by_id: DashMap<String, Arc<ChannelConfig>>,
    detected: DashMap<String, Vec<u64>>,
}

impl ChannelStore {
    pub fn new(channels: Vec<ChannelConfig>) -> Self {
        let store = Self {
            by_slug: DashMap::new(),
            by_id: DashMap::new(),
            detected: DashMap::new(),
        };
        for channel in channels {
            // A channel with an unfetchable origin would poison every request
            // routed to it; drop it at seed time instead
            match url::Url::parse(&channel.origin_url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                _ => {
                    warn!(
                        "Skipping channel {}: invalid origin URL {}",
                        channel.id, channel.origin_url
                    );
                    continue;
                }
            }
            let channel = Arc::new(channel);
            store
                .by_slug
                .insert(Self::slug_key(&channel.org_slug, &channel.slug), channel.clone());
            store.by_id.insert(channel.id.clone(), channel);
        }
        store
    }

    /// Seed from `CHANNELS_FILE` when set, otherwise a single dev channel
    /// pointed at the config's default origin.
    pub fn from_config(config: &Config) -> Self {
        if let Some(path) = &config.channels_file {
            match std::fs::read_to_string(path)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    serde_json::from_str::<Vec<ChannelConfig>>(&text).map_err(|e| e.to_string())
                }) {
                Ok(channels) => {
                    info!("Loaded {} channel(s) from {}", channels.len(), path);
                    return Self::new(channels);
                }
                Err(e) => {
                    warn!("Failed to load channels from {}: {}, using dev default", path, e);
                }
            }
        }

        Self::new(vec![ChannelConfig {
            id: "ch-demo-news".to_string(),
            org_slug: "demo".to_string(),
            slug: "news".to_string(),
            origin_url: config.origin_variant_base.clone(),
            ad_pod_base_url: Some(config.ad_pod_base.clone()),
            sign_host: Some(config.sign_host.clone()),
            status: ChannelStatus::Active,
            mode: ChannelMode::Auto,
            tier: 0,
            scte35_auto_insert: true,
            time_based_auto_insert: false,
            slate_url: config.slate_url.clone(),
            bitrate_ladder: Vec::new(),
            segment_cache_max_age: None,
            manifest_cache_max_age: None,
        }])
    }

    fn slug_key(org: &str, slug: &str) -> String {
        format!("{}/{}", org, slug)
    }

    pub fn lookup(&self, org: &str, slug: &str) -> Option<Arc<ChannelConfig>> {
        self.by_slug.get(&Self::slug_key(org, slug)).map(|c| c.clone())
    }

    /// Fallback lookup by bare slug for the legacy query-string route and
    /// the cue endpoint, where the org may be omitted.
    pub fn lookup_slug(&self, slug: &str) -> Option<Arc<ChannelConfig>> {
        self.by_slug
            .iter()
            .find(|entry| entry.value().slug == slug)
            .map(|entry| entry.value().clone())
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<ChannelConfig>> {
        self.by_id.get(id).map(|c| c.clone())
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.by_id.iter().map(|e| e.key().clone()).collect()
    }

    /// Persist a detected bitrate ladder for an auto-mode channel.
    pub fn set_detected_bitrates(&self, channel_id: &str, kbps: Vec<u64>) {
        info!("Detected bitrate ladder for {}: {:?} kbps", channel_id, kbps);
        self.detected.insert(channel_id.to_string(), kbps);
    }

    pub fn detected_bitrates(&self, channel_id: &str) -> Option<Vec<u64>> {
        self.detected.get(channel_id).map(|v| v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(org: &str, slug: &str, id: &str) -> ChannelConfig {
        ChannelConfig {
            id: id.to_string(),
            org_slug: org.to_string(),
            slug: slug.to_string(),
            origin_url: "https://origin.example.com/live".to_string(),
            ad_pod_base_url: None,
            sign_host: None,
            status: ChannelStatus::Active,
            mode: ChannelMode::Auto,
            tier: 0,
            scte35_auto_insert: true,
            time_based_auto_insert: false,
            slate_url: None,
            bitrate_ladder: vec![800, 2000, 5000],
            segment_cache_max_age: None,
            manifest_cache_max_age: None,
        }
    }

    #[test]
    fn lookup_by_org_and_slug() {
        let store = ChannelStore::new(vec![channel("acme", "news", "ch1")]);
        assert!(store.lookup("acme", "news").is_some());
        assert!(store.lookup("other", "news").is_none());
        assert!(store.by_id("ch1").is_some());
    }

    #[test]
    fn variant_url_joins_cleanly() {
        let ch = channel("acme", "news", "ch1");
        assert_eq!(
            ch.variant_url("2000.m3u8"),
            "https://origin.example.com/live/2000.m3u8"
        );
    }

    #[test]
    fn mid_tier_prefers_configured_ladder() {
        let ch = channel("acme", "news", "ch1");
        assert_eq!(ch.mid_tier_variant(None), "2000.m3u8");
    }

    #[test]
    fn mid_tier_falls_back_to_detected_then_default() {
        let mut ch = channel("acme", "news", "ch1");
        ch.bitrate_ladder.clear();
        assert_eq!(ch.mid_tier_variant(Some(&vec![500, 1500])), "1500.m3u8");
        assert_eq!(ch.mid_tier_variant(None), "playlist.m3u8");
    }

    #[test]
    fn detected_bitrates_round_trip() {
        let store = ChannelStore::new(vec![channel("acme", "news", "ch1")]);
        store.set_detected_bitrates("ch1", vec![800, 2000]);
        assert_eq!(store.detected_bitrates("ch1"), Some(vec![800, 2000]));
    }

    #[test]
    fn invalid_origin_is_dropped_at_seed() {
        let mut bad = channel("acme", "bad", "ch-bad");
        bad.origin_url = "not a url".to_string();
        let mut ftp = channel("acme", "ftp", "ch-ftp");
        ftp.origin_url = "ftp://origin.example.com/live".to_string();

        let store = ChannelStore::new(vec![channel("acme", "news", "ch1"), bad, ftp]);

        assert!(store.lookup("acme", "news").is_some());
        assert!(store.lookup("acme", "bad").is_none());
        assert!(store.lookup("acme", "ftp").is_none());
    }

    #[test]
    fn channel_json_defaults() {
        let row: ChannelConfig = serde_json::from_str(
            r#"{"id":"c1","org_slug":"acme","slug":"news","origin_url":"https://o.example.com"}"#,
        )
        .unwrap();
        assert_eq!(row.mode, ChannelMode::Auto);
        assert_eq!(row.status, ChannelStatus::Active);
        assert_eq!(row.tier, 0);
        assert!(row.scte35_auto_insert);
        assert!(!row.time_based_auto_insert);
    }
}
