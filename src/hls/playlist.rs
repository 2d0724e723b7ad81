//! Media-playlist mutation engine.
//!
//! Everything the manifest pipeline does to a playlist happens here: PDT and
//! bitrate extraction, origin SCTE-35 stripping, interstitial DATERANGE
//! injection (SGAI), skip-plan computation and content-segment replacement
//! (SSAI) with the boundary-snap policy.
//!
//! The rewrite is deterministic: given the same input window and the same
//! bound skip count it produces byte-identical output, which is what keeps
//! every rendition of a break aligned.

use crate::error::{AdEdgeError, Result};
use crate::metrics;
use crate::scte35::decoder::is_scte35_daterange;
use chrono::{DateTime, FixedOffset};
use m3u8_rs::{parse_playlist_res, DateRange, MediaPlaylist, MediaSegment, Playlist, QuotedOrUnquoted};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Segments that must remain after a break; fewer means the rewrite refuses
/// and the caller falls back to unmodified content.
const MIN_REMAINING_SEGMENTS: usize = 3;

/// Ad-pod total may differ from the planned break duration by this much
/// before padding/trimming kicks in.
const SNAP_TOLERANCE_SECS: f64 = 0.5;

/// One segment of an ad pod (or slate filler) ready for splicing.
#[derive(Debug, Clone, PartialEq)]
pub struct AdMediaSegment {
    pub uri: String,
    pub duration_sec: f64,
    /// Slate-typed segments may be trimmed by the boundary snap; ad-typed
    /// segments never are.
    pub slate: bool,
}

/// How the ad pod total related to the planned break duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundarySnap {
    Exact,
    Padded,
    Trimmed,
    Underrun,
    Overrun,
    Fallback,
}

impl BoundarySnap {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoundarySnap::Exact => "exact",
            BoundarySnap::Padded => "padded",
            BoundarySnap::Trimmed => "trimmed",
            BoundarySnap::Underrun => "underrun",
            BoundarySnap::Overrun => "overrun",
            BoundarySnap::Fallback => "fallback",
        }
    }
}

/// Result of [`calculate_skip_plan`].
#[derive(Debug, Clone, PartialEq)]
pub struct SkipPlan {
    pub segments_skipped: usize,
    pub duration_skipped: f64,
    pub stable_skip_count: usize,
    pub resume_pdt: Option<String>,
    pub remaining_segments: usize,
}

/// Result of [`replace_segments_with_ads`].
#[derive(Debug)]
pub struct RewriteOutcome {
    pub playlist: MediaPlaylist,
    pub segments_skipped: usize,
    pub duration_skipped: f64,
    pub actual_ad_duration: f64,
    pub boundary_snap: BoundarySnap,
}

/// Parameters for [`inject_interstitial`].
#[derive(Debug, Clone)]
pub struct InterstitialSpec {
    pub id: String,
    pub start_pdt: DateTime<FixedOffset>,
    pub duration_sec: f64,
    pub asset_uri: String,
    pub scte35_payload: Option<Vec<u8>>,
}

// ── Parse / serialize ───────────────────────────────────────────────────

pub fn parse_playlist(content: &str) -> Result<Playlist> {
    parse_playlist_res(content.as_bytes())
        .map_err(|e| AdEdgeError::PlaylistParse(format!("{:?}", e)))
}

pub fn parse_media_playlist(content: &str) -> Result<MediaPlaylist> {
    match parse_playlist(content)? {
        Playlist::MediaPlaylist(media) => Ok(media),
        Playlist::MasterPlaylist(_) => Err(AdEdgeError::PlaylistParse(
            "expected media playlist, got master playlist".to_string(),
        )),
    }
}

pub fn serialize_playlist(playlist: &Playlist) -> Result<String> {
    let mut output = Vec::new();
    playlist
        .write_to(&mut output)
        .map_err(|e| AdEdgeError::PlaylistRewrite(format!("failed to write playlist: {}", e)))?;
    let mut text = String::from_utf8(output)
        .map_err(|e| AdEdgeError::PlaylistRewrite(format!("playlist is not UTF-8: {}", e)))?;
    if !text.ends_with('\n') {
        text.push('\n');
    }
    Ok(text)
}

pub fn serialize_media_playlist(playlist: MediaPlaylist) -> Result<String> {
    serialize_playlist(&Playlist::MediaPlaylist(playlist))
}

// ── Extraction ──────────────────────────────────────────────────────────

/// PDT strings for every segment that explicitly carries one, in order.
pub fn extract_pdts(playlist: &MediaPlaylist) -> Vec<String> {
    playlist
        .segments
        .iter()
        .filter_map(|s| s.program_date_time.map(|pdt| pdt.to_rfc3339()))
        .collect()
}

/// Effective per-segment PDT in epoch ms: explicit tags anchor the timeline,
/// untagged segments extend the previous anchor by the preceding EXTINF.
pub fn segment_pdts_ms(playlist: &MediaPlaylist) -> Vec<Option<i64>> {
    let mut out = Vec::with_capacity(playlist.segments.len());
    let mut rolling: Option<i64> = None;
    for seg in &playlist.segments {
        let pdt = match seg.program_date_time {
            Some(explicit) => Some(explicit.timestamp_millis()),
            None => rolling,
        };
        out.push(pdt);
        rolling = pdt.map(|ms| ms + (seg.duration as f64 * 1000.0).round() as i64);
    }
    out
}

/// Most recent (last) effective PDT of the window.
pub fn last_pdt_ms(playlist: &MediaPlaylist) -> Option<i64> {
    segment_pdts_ms(playlist).into_iter().flatten().last()
}

/// Bitrate ladder in kbps from a master playlist, ascending, deduped.
pub fn extract_bitrates(master: &m3u8_rs::MasterPlaylist) -> Vec<u64> {
    let mut kbps: Vec<u64> = master
        .variants
        .iter()
        .map(|v| (v.bandwidth / 1000) as u64)
        .collect();
    kbps.sort_unstable();
    kbps.dedup();
    kbps
}

// ── Origin SCTE-35 stripping ────────────────────────────────────────────

fn is_cue_tag(tag_name: &str) -> bool {
    matches!(
        tag_name,
        "X-CUE-OUT" | "CUE-OUT" | "X-CUE-OUT-CONT" | "CUE-OUT-CONT" | "X-CUE-IN" | "CUE-IN"
    )
}

/// Removes origin-sourced SCTE-35 decorations: SCTE-classed DATERANGEs and
/// CUE-OUT/CUE-OUT-CONT/CUE-IN markers. Interstitial DATERANGEs and every
/// segment URI and PDT are preserved. Applying it twice is a no-op.
pub fn strip_origin_scte35(playlist: &mut MediaPlaylist) {
    for seg in playlist.segments.iter_mut() {
        if seg
            .daterange
            .as_ref()
            .is_some_and(is_scte35_daterange)
        {
            seg.daterange = None;
        }
        seg.unknown_tags.retain(|tag| !is_cue_tag(&tag.tag));
    }
}

// ── SGAI interstitial injection ─────────────────────────────────────────

/// Injects exactly one interstitial DATERANGE for the break.
///
/// The tag is emitted ahead of the first segment so every joiner sees it
/// immediately; START-DATE aims the player at the actual splice point.
/// Callers strip origin SCTE-35 first, so the head slot is normally free —
/// an origin interstitial already sitting there is left alone and the next
/// free segment is used.
pub fn inject_interstitial(playlist: &mut MediaPlaylist, spec: &InterstitialSpec) {
    let index = playlist
        .segments
        .iter()
        .position(|seg| seg.daterange.is_none())
        .unwrap_or(0);

    let mut x_prefixed = HashMap::new();
    x_prefixed.insert(
        "X-ASSET-URI".to_string(),
        QuotedOrUnquoted::Quoted(spec.asset_uri.clone()),
    );

    let other_attributes = spec.scte35_payload.as_ref().map(|payload| {
        let mut other = HashMap::new();
        other.insert(
            "SCTE35-OUT".to_string(),
            QuotedOrUnquoted::Unquoted(format!("0x{}", hex::encode(payload))),
        );
        other
    });

    let daterange = DateRange {
        id: spec.id.clone(),
        class: Some("com.apple.hls.interstitial".to_string()),
        start_date: spec.start_pdt,
        end_date: None,
        duration: Some(spec.duration_sec),
        planned_duration: None,
        x_prefixed: Some(x_prefixed),
        end_on_next: false,
        other_attributes,
    };

    info!(
        "SGAI: interstitial {} at segment #{} duration={:.3}s",
        spec.id, index, spec.duration_sec
    );

    if let Some(seg) = playlist.segments.get_mut(index) {
        seg.daterange = Some(daterange);
    }
}

// ── Skip plan ───────────────────────────────────────────────────────────

fn find_segment_by_pdt(pdts: &[Option<i64>], start_ms: i64) -> Option<usize> {
    pdts.iter().position(|pdt| *pdt == Some(start_ms))
}

/// Computes how many content segments a break replaces, starting at the
/// segment whose PDT equals `start_ms`.
///
/// With `stable_skip_count` supplied the count is used verbatim (duration is
/// ignored) — that is what keeps later renditions and later windows on the
/// plan the first rewrite bound. Returns `None` when the start PDT is not in
/// the window (late joiner).
pub fn calculate_skip_plan(
    playlist: &MediaPlaylist,
    start_ms: i64,
    scte35_duration: f64,
    stable_skip_count: Option<usize>,
) -> Option<SkipPlan> {
    let pdts = segment_pdts_ms(playlist);
    let start_idx = find_segment_by_pdt(&pdts, start_ms)?;

    let available = playlist.segments.len() - start_idx;
    let mut skipped = 0usize;
    let mut duration_skipped = 0f64;

    match stable_skip_count {
        Some(count) => {
            skipped = count.min(available);
            duration_skipped = playlist.segments[start_idx..start_idx + skipped]
                .iter()
                .map(|s| s.duration as f64)
                .sum();
        }
        None => {
            for seg in &playlist.segments[start_idx..] {
                skipped += 1;
                duration_skipped += seg.duration as f64;
                if duration_skipped >= scte35_duration {
                    break;
                }
            }
        }
    }

    let resume_idx = start_idx + skipped;
    let resume_pdt = pdts
        .get(resume_idx)
        .copied()
        .flatten()
        .or_else(|| {
            pdts.get(start_idx)
                .copied()
                .flatten()
                .map(|ms| ms + (duration_skipped * 1000.0).round() as i64)
        })
        .map(ms_to_rfc3339);

    Some(SkipPlan {
        segments_skipped: skipped,
        duration_skipped,
        stable_skip_count: skipped,
        resume_pdt,
        remaining_segments: playlist.segments.len().saturating_sub(resume_idx),
    })
}

fn ms_to_rfc3339(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.fixed_offset().to_rfc3339())
        .unwrap_or_default()
}

// ── Boundary snap ───────────────────────────────────────────────────────

/// Aligns the ad pod total with the planned break duration.
///
/// Shorter by more than the tolerance: cycle slate segments to close the
/// gap (rounded up to a whole segment). Longer: trim trailing slate-typed
/// segments only. The outcome is recorded for telemetry by the caller.
pub fn condition_ad_pod(
    mut pod: Vec<AdMediaSegment>,
    planned_duration: f64,
    slate: Option<&[AdMediaSegment]>,
) -> (Vec<AdMediaSegment>, BoundarySnap) {
    let total = |segs: &[AdMediaSegment]| segs.iter().map(|s| s.duration_sec).sum::<f64>();

    let mut actual = total(&pod);
    if (actual - planned_duration).abs() <= SNAP_TOLERANCE_SECS {
        return (pod, BoundarySnap::Exact);
    }

    if actual < planned_duration {
        let Some(slate) = slate.filter(|s| !s.is_empty()) else {
            warn!(
                "Ad pod underrun: {:.3}s of {:.3}s planned, no slate configured",
                actual, planned_duration
            );
            return (pod, BoundarySnap::Underrun);
        };
        let mut cycle = slate.iter().cycle();
        while actual + SNAP_TOLERANCE_SECS < planned_duration {
            let filler = cycle.next().expect("cycle over non-empty slice");
            actual += filler.duration_sec;
            pod.push(AdMediaSegment {
                slate: true,
                ..filler.clone()
            });
        }
        return (pod, BoundarySnap::Padded);
    }

    // Overrun: drop trailing slate, never ad creative
    let mut trimmed = false;
    while actual - planned_duration > SNAP_TOLERANCE_SECS
        && pod.last().is_some_and(|s| s.slate)
    {
        let removed = pod.pop().expect("checked last above");
        actual -= removed.duration_sec;
        trimmed = true;
    }

    if actual - planned_duration > SNAP_TOLERANCE_SECS {
        warn!(
            "Ad pod overrun: {:.3}s of {:.3}s planned, trailing segments are ad-typed",
            actual, planned_duration
        );
        (pod, BoundarySnap::Overrun)
    } else if trimmed {
        (pod, BoundarySnap::Trimmed)
    } else {
        (pod, BoundarySnap::Exact)
    }
}

// ── SSAI segment replacement ────────────────────────────────────────────

fn cue_tag_priority(tag: &str) -> u8 {
    // Fixed decoration order: CUE-OUT ahead of anything else
    if tag.ends_with("CUE-OUT") {
        0
    } else if tag.ends_with("CUE-OUT-CONT") {
        1
    } else {
        2
    }
}

/// Replaces content segments with ad segments starting at `start_ms`.
///
/// The spliced region is framed by DISCONTINUITY tags; the first ad segment
/// inherits the break-start PDT and any preserved (non-SCTE) DATERANGE plus
/// CUE-OUT markers from the replaced region; the resume segment gets an
/// explicit PDT and the CUE-IN markers. Returns `None` when the start PDT is
/// not present or the rewrite would leave fewer than three content segments
/// after the break — the caller then falls back to unmodified content.
pub fn replace_segments_with_ads(
    playlist: &MediaPlaylist,
    start_ms: i64,
    ad_segments: &[AdMediaSegment],
    planned_duration: f64,
    stable_skip_count: Option<usize>,
) -> Option<RewriteOutcome> {
    if ad_segments.is_empty() {
        return None;
    }

    let plan = calculate_skip_plan(playlist, start_ms, planned_duration, stable_skip_count)?;
    if plan.remaining_segments < MIN_REMAINING_SEGMENTS {
        debug!(
            "Refusing rewrite: only {} segments would remain after the break",
            plan.remaining_segments
        );
        return None;
    }

    let pdts = segment_pdts_ms(playlist);
    let start_idx = find_segment_by_pdt(&pdts, start_ms)?;
    let resume_idx = start_idx + plan.segments_skipped;

    // Decorations gathered from the replaced region
    let replaced = &playlist.segments[start_idx..resume_idx];
    let preserved_daterange = replaced
        .iter()
        .filter_map(|s| s.daterange.as_ref())
        .find(|dr| !is_scte35_daterange(dr))
        .cloned();
    let mut leading_tags: Vec<m3u8_rs::ExtTag> = replaced
        .iter()
        .flat_map(|s| s.unknown_tags.iter())
        .filter(|t| is_cue_tag(&t.tag) && !t.tag.ends_with("CUE-IN"))
        .cloned()
        .collect();
    leading_tags.sort_by_key(|t| cue_tag_priority(&t.tag));
    let trailing_tags: Vec<m3u8_rs::ExtTag> = replaced
        .iter()
        .flat_map(|s| s.unknown_tags.iter())
        .filter(|t| is_cue_tag(&t.tag) && t.tag.ends_with("CUE-IN"))
        .cloned()
        .collect();

    let start_pdt = DateTime::from_timestamp_millis(start_ms).map(|dt| dt.fixed_offset());
    let resume_pdt = pdts
        .get(resume_idx)
        .copied()
        .flatten()
        .and_then(DateTime::from_timestamp_millis)
        .map(|dt| dt.fixed_offset());

    // Consumed SCTE DATERANGEs must not survive the splice, wherever the
    // origin attached them
    let sanitize = |seg: &MediaSegment| {
        let mut seg = seg.clone();
        if seg.daterange.as_ref().is_some_and(is_scte35_daterange) {
            seg.daterange = None;
        }
        seg
    };

    let mut out_segments: Vec<MediaSegment> =
        Vec::with_capacity(playlist.segments.len() - plan.segments_skipped + ad_segments.len());
    out_segments.extend(playlist.segments[..start_idx].iter().map(sanitize));

    for (i, ad) in ad_segments.iter().enumerate() {
        let mut seg = MediaSegment {
            uri: ad.uri.clone(),
            duration: ad.duration_sec as f32,
            ..Default::default()
        };
        if i == 0 {
            seg.discontinuity = true;
            seg.program_date_time = start_pdt;
            seg.daterange = preserved_daterange.clone();
            seg.unknown_tags = leading_tags.clone();
        }
        out_segments.push(seg);
    }

    let mut resume = sanitize(&playlist.segments[resume_idx]);
    resume.discontinuity = true;
    if resume.program_date_time.is_none() {
        resume.program_date_time = resume_pdt;
    }
    let mut resume_tags = trailing_tags;
    let old_tags = std::mem::take(&mut resume.unknown_tags);
    resume_tags.extend(old_tags.into_iter().filter(|t| !is_cue_tag(&t.tag)));
    resume.unknown_tags = resume_tags;
    out_segments.push(resume);

    out_segments.extend(playlist.segments[resume_idx + 1..].iter().map(sanitize));

    let mut out = playlist.clone();
    out.segments = out_segments;
    // No leading segment is dropped, so the first emitted segment keeps the
    // input's sequence number
    out.media_sequence = playlist.media_sequence;

    let actual_ad_duration = ad_segments.iter().map(|s| s.duration_sec).sum();

    Some(RewriteOutcome {
        playlist: out,
        segments_skipped: plan.segments_skipped,
        duration_skipped: plan.duration_skipped,
        actual_ad_duration,
        boundary_snap: BoundarySnap::Exact,
    })
}

/// Full SSAI rewrite: boundary-snaps the pod, splices it, records telemetry.
pub fn splice_ad_pod(
    playlist: &MediaPlaylist,
    start_ms: i64,
    pod: Vec<AdMediaSegment>,
    planned_duration: f64,
    stable_skip_count: Option<usize>,
    slate: Option<&[AdMediaSegment]>,
) -> Option<RewriteOutcome> {
    let (conditioned, snap) = condition_ad_pod(pod, planned_duration, slate);
    let outcome = replace_segments_with_ads(
        playlist,
        start_ms,
        &conditioned,
        planned_duration,
        stable_skip_count,
    );
    let snap = if outcome.is_some() {
        snap
    } else {
        BoundarySnap::Fallback
    };
    metrics::record_boundary_snap(snap.as_str());
    outcome.map(|mut o| {
        o.boundary_snap = snap;
        o
    })
}

// ── Synthetic fallback manifest ─────────────────────────────────────────

/// Minimal valid manifest served with 200 when the origin is unreachable,
/// so players keep polling instead of erroring out.
pub fn synthetic_slate_manifest(slate_uri: Option<&str>) -> String {
    let uri = slate_uri.unwrap_or("slate.ts");
    format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:10.0,\n{}\n",
        uri
    )
}

// ── Tests ───────────────────────────────────────────────────────────────
