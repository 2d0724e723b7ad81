//! HLS playlist parsing and rewriting.

pub mod playlist;

pub use playlist::{
    calculate_skip_plan, condition_ad_pod, extract_bitrates, extract_pdts, inject_interstitial,
    last_pdt_ms, parse_media_playlist, parse_playlist, replace_segments_with_ads,
    segment_pdts_ms, serialize_media_playlist, serialize_playlist, splice_ad_pod,
    strip_origin_scte35, synthetic_slate_manifest, AdMediaSegment, BoundarySnap,
    InterstitialSpec, RewriteOutcome, SkipPlan,
};
