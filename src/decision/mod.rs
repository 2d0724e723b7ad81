//! Ad decision types and collaborator client.
//!
//! A decision covers every bitrate of the pod; it is never parameterized by
//! viewer. The renderer picks the bitrate-matched item per rendition.

pub mod client;

pub use client::{fetch_ad_segments, DecisionClient};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Audio renditions at or below this bitrate only ever receive audio-weight
/// pod items.
const AUDIO_BITRATE_CEILING_BPS: u64 = 256_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub pod: AdPod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<Tracking>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdPod {
    pub pod_id: String,
    pub duration_sec: f64,
    pub items: Vec<AdPodItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdPodItem {
    pub ad_id: String,
    /// Bits per second.
    pub bitrate: u64,
    pub playlist_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tracking {
    #[serde(default)]
    pub impressions: Vec<String>,
    #[serde(default)]
    pub quartiles: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub clicks: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Picks the pod item for one rendition.
///
/// Regular variants get the highest-bitrate item not exceeding the viewer
/// bitrate, or the lowest item when all exceed it. Audio-only variants
/// (≤ 256 kbps and "audio" in the variant name) only consider audio-weight
/// items; with none available the ad is suppressed (`None`).
pub fn select_ad_variant<'a>(
    items: &'a [AdPodItem],
    viewer_bitrate_bps: u64,
    variant_name: &str,
) -> Option<&'a AdPodItem> {
    if items.is_empty() {
        return None;
    }

    let audio_only = viewer_bitrate_bps <= AUDIO_BITRATE_CEILING_BPS
        && variant_name.to_lowercase().contains("audio");

    // Audio renditions only ever receive audio-weight items; with none the
    // ad is suppressed for that rendition
    let pool: Vec<&AdPodItem> = if audio_only {
        items
            .iter()
            .filter(|i| i.bitrate <= AUDIO_BITRATE_CEILING_BPS)
            .collect()
    } else {
        items.iter().collect()
    };

    pool.iter()
        .filter(|i| i.bitrate <= viewer_bitrate_bps)
        .max_by_key(|i| i.bitrate)
        .or_else(|| pool.iter().min_by_key(|i| i.bitrate))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(bitrates: &[u64]) -> Vec<AdPodItem> {
        bitrates
            .iter()
            .map(|b| AdPodItem {
                ad_id: format!("ad-{}", b),
                bitrate: *b,
                playlist_url: format!("https://ads.example.com/{}.m3u8", b),
            })
            .collect()
    }

    #[test]
    fn picks_max_item_at_or_below_viewer_bitrate() {
        let pool = items(&[800_000, 2_000_000, 5_000_000]);
        let pick = select_ad_variant(&pool, 2_500_000, "2500.m3u8").unwrap();
        assert_eq!(pick.bitrate, 2_000_000);
    }

    #[test]
    fn exact_match_wins() {
        let pool = items(&[800_000, 2_000_000]);
        let pick = select_ad_variant(&pool, 2_000_000, "2000.m3u8").unwrap();
        assert_eq!(pick.bitrate, 2_000_000);
    }

    #[test]
    fn all_items_above_viewer_picks_lowest() {
        let pool = items(&[2_000_000, 5_000_000]);
        let pick = select_ad_variant(&pool, 400_000, "400.m3u8").unwrap();
        assert_eq!(pick.bitrate, 2_000_000);
    }

    #[test]
    fn audio_variant_filters_to_audio_weight() {
        let pool = items(&[96_000, 2_000_000]);
        let pick = select_ad_variant(&pool, 128_000, "audio-en.m3u8").unwrap();
        assert_eq!(pick.bitrate, 96_000);
    }

    #[test]
    fn audio_variant_without_audio_items_suppresses() {
        let pool = items(&[800_000, 2_000_000]);
        assert!(select_ad_variant(&pool, 128_000, "audio-en.m3u8").is_none());
    }

    #[test]
    fn low_bitrate_video_variant_is_not_audio_gated() {
        let pool = items(&[800_000, 2_000_000]);
        // ≤256kbps but no "audio" in the name: normal selection applies
        let pick = select_ad_variant(&pool, 200_000, "240p.m3u8").unwrap();
        assert_eq!(pick.bitrate, 800_000);
    }

    #[test]
    fn empty_items_suppress() {
        assert!(select_ad_variant(&[], 2_000_000, "2000.m3u8").is_none());
    }

    #[test]
    fn decision_wire_format_is_camel_case() {
        let json = r#"{
            "pod": {
                "podId": "pod-1",
                "durationSec": 30.0,
                "items": [{"adId": "a1", "bitrate": 2000000, "playlistUrl": "https://a/p.m3u8"}]
            },
            "tracking": {"impressions": ["https://t/imp"], "quartiles": {"midpoint": ["https://t/mid"]}}
        }"#;
        let decision: DecisionResponse = serde_json::from_str(json).unwrap();
        assert_eq!(decision.pod.pod_id, "pod-1");
        assert_eq!(decision.pod.items[0].bitrate, 2_000_000);
        assert_eq!(
            decision.tracking.unwrap().impressions,
            vec!["https://t/imp".to_string()]
        );
    }
}
