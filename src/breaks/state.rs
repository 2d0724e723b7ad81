//! Per-channel ad-break state machine.
//!
//! At most one break is active per channel. The invariants that keep every
//! rendition of a break aligned live here: the stable pod id derived once
//! from the start time, the millisecond-quantized duration, the write-once
//! skip count, and the processed-event set that absorbs re-advertised
//! SCTE-35 signals.

use crate::metrics;
use crate::scte35::Scte35Signal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// Decision freshness window.
pub const DECISION_TTL_MS: i64 = 30_000;

/// OUT signals starting within this distance of an existing break are folded
/// into it instead of opening a second break.
pub const DEDUPE_PROXIMITY_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakSource {
    Scte35,
    Manual,
    Time,
}

impl BreakSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakSource::Scte35 => "scte35",
            BreakSource::Manual => "manual",
            BreakSource::Time => "time",
        }
    }
}

/// Cross-rendition rewrite contract for one break.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SharedManifestPlan {
    /// PDT of the first replaced content segment.
    pub start_pdt: String,
    pub leading_decorations: Vec<String>,
    pub trailing_decorations: Vec<String>,
    /// Authoritative number of content segments replaced.
    pub stable_skip_count: usize,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdBreakState {
    /// `ad_{channel_id}_{floor(started_at/1000)}`; never re-derived once set.
    pub pod_id: String,
    pub channel_id: String,
    pub source: BreakSource,
    /// Operator-supplied pod playlist (manual breaks).
    pub pod_url: Option<String>,
    /// Epoch ms. SCTE-35-sourced breaks use the signal's START-DATE.
    pub started_at: i64,
    pub ends_at: i64,
    /// Millisecond-quantized; never mutated after creation.
    pub duration_sec: f64,
    pub scte35_start_pdt: Option<String>,
    /// Raw splice_info bytes for SGAI SCTE35-OUT passthrough.
    #[serde(default)]
    pub scte35_payload: Option<Vec<u8>>,
    /// 0 means not yet bound. Written exactly once by the first successful
    /// SSAI rewrite; every later request reuses it.
    pub content_segments_to_skip: usize,
    pub skipped_duration: f64,
    pub processed_event_ids: HashSet<String>,
    pub decision: Option<crate::decision::DecisionResponse>,
    pub decision_calculated_at: Option<i64>,
    pub manifest_plan: Option<SharedManifestPlan>,
    pub version: u64,
}

/// `round(d*1000)/1000` — keeps serialized durations stable so players never
/// see schedule jitter from floating-point drift.
pub fn quantize_duration(d: f64) -> f64 {
    (d * 1000.0).round() / 1000.0
}

impl AdBreakState {
    pub fn new(
        channel_id: &str,
        source: BreakSource,
        started_at: i64,
        duration_sec: f64,
        scte35_start_pdt: Option<String>,
    ) -> Self {
        let duration_sec = quantize_duration(duration_sec);
        Self {
            pod_id: format!("ad_{}_{}", channel_id, started_at.div_euclid(1000)),
            channel_id: channel_id.to_string(),
            source,
            pod_url: None,
            started_at,
            ends_at: started_at + (duration_sec * 1000.0).round() as i64,
            duration_sec,
            scte35_start_pdt,
            scte35_payload: None,
            content_segments_to_skip: 0,
            skipped_duration: 0.0,
            processed_event_ids: HashSet::new(),
            decision: None,
            decision_calculated_at: None,
            manifest_plan: None,
            version: 1,
        }
    }

    pub fn is_active(&self, now_ms: i64) -> bool {
        now_ms < self.ends_at
    }

    pub fn skip_bound(&self) -> bool {
        self.content_segments_to_skip > 0
    }

    pub fn decision_fresh(&self, now_ms: i64) -> bool {
        self.decision.is_some()
            && self
                .decision_calculated_at
                .is_some_and(|at| now_ms - at <= DECISION_TTL_MS)
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    /// Records an observed event id. Returns true when it was new.
    pub fn absorb_event(&mut self, event_id: &str) -> bool {
        let added = self.processed_event_ids.insert(event_id.to_string());
        if added {
            self.touch();
        }
        added
    }

    /// Binds the skip plan on the first successful rewrite. On later calls
    /// a differing recomputation is a telemetry anomaly and the stored value
    /// wins.
    pub fn bind_skip_plan(&mut self, segments_skipped: usize, duration_skipped: f64) {
        if self.skip_bound() {
            if self.content_segments_to_skip != segments_skipped {
                metrics::record_skip_count_anomaly();
                warn!(
                    "Skip-count anomaly on {}: bound {} vs recomputed {}, keeping bound value",
                    self.pod_id, self.content_segments_to_skip, segments_skipped
                );
            }
            return;
        }
        self.content_segments_to_skip = segments_skipped;
        self.skipped_duration = duration_skipped;
        self.touch();
        info!(
            "Bound skip plan for {}: {} segments / {:.3}s",
            self.pod_id, segments_skipped, duration_skipped
        );
    }

    pub fn store_decision(&mut self, decision: crate::decision::DecisionResponse, now_ms: i64) {
        self.decision = Some(decision);
        self.decision_calculated_at = Some(now_ms);
        self.touch();
    }

    pub fn store_plan(&mut self, plan: SharedManifestPlan) {
        self.manifest_plan = Some(plan);
        self.touch();
    }
}

/// Outcome of feeding an OUT signal into the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOutcome {
    /// A new break was created.
    Opened,
    /// The event id was folded into the existing break (new id, same break).
    Merged,
    /// The event id was already processed; state unchanged apart from the set.
    Duplicate,
    /// Signal ignored (tier gate, already-expired signal, or a live break
    /// holds precedence).
    Ignored,
}

/// The per-channel slot holding at most one break, plus transition logic.
#[derive(Debug, Default)]
pub struct BreakSlot {
    pub current: Option<AdBreakState>,
}

impl BreakSlot {
    /// Wall-clock and manifest-window expiry. Returns the cleared break.
    pub fn expire(&mut self, now_ms: i64, window_expiry_ms: i64) -> Option<AdBreakState> {
        let expired = match &self.current {
            Some(b) if !b.is_active(now_ms) => true,
            Some(b)
                if b.source == BreakSource::Scte35
                    && now_ms - b.started_at > window_expiry_ms =>
            {
                info!("Break {} rolled out of the live window", b.pod_id);
                true
            }
            _ => false,
        };
        if expired {
            self.current.take()
        } else {
            None
        }
    }

    /// Feeds an accepted OUT signal through the dedupe rules.
    ///
    /// Order matters: a known event id never allocates a new break; an
    /// unknown id starting within [`DEDUPE_PROXIMITY_MS`] of the live break
    /// is associated with it; otherwise a break opens (only when the slot is
    /// empty — a live break from another trigger keeps precedence).
    pub fn on_scte35_out(
        &mut self,
        channel_id: &str,
        signal: &Scte35Signal,
        tier_matches: bool,
        now_ms: i64,
    ) -> OutOutcome {
        if !tier_matches {
            metrics::record_scte35_signal("rejected");
            return OutOutcome::Ignored;
        }

        // A re-advertised OUT whose implied end has passed must never
        // (re)open a break
        if signal.end_ms().is_some_and(|end| end <= now_ms) {
            metrics::record_scte35_signal("stale");
            return OutOutcome::Ignored;
        }

        if let Some(current) = &mut self.current {
            if current.processed_event_ids.contains(&signal.event_id) {
                metrics::record_scte35_signal("duplicate");
                return OutOutcome::Duplicate;
            }
            if (signal.start_ms - current.started_at).abs() < DEDUPE_PROXIMITY_MS {
                current.absorb_event(&signal.event_id);
                metrics::record_proximity_merge();
                info!(
                    "Merged SCTE-35 event {} into break {} (start proximity)",
                    signal.event_id, current.pod_id
                );
                return OutOutcome::Merged;
            }
            // A distinct future break while one is live: the active break
            // keeps precedence for mutation; the signal is left for the next
            // evaluation cycle after expiry
            return OutOutcome::Ignored;
        }

        let duration = signal.duration_sec.unwrap_or(0.0);
        if duration <= 0.0 {
            metrics::record_scte35_signal("rejected");
            return OutOutcome::Ignored;
        }

        let mut state = AdBreakState::new(
            channel_id,
            BreakSource::Scte35,
            signal.start_ms,
            duration,
            Some(signal.start_iso.clone()),
        );
        state.scte35_payload = (!signal.raw.is_empty()).then(|| signal.raw.clone());
        state.processed_event_ids.insert(signal.event_id.clone());
        metrics::record_scte35_signal("accepted");
        info!(
            "Opened SCTE-35 break {} on {}: start={} duration={:.3}s",
            state.pod_id, channel_id, state.started_at, state.duration_sec
        );
        self.current = Some(state);
        OutOutcome::Opened
    }

    /// Matching IN (same event id) terminates the break.
    pub fn on_scte35_in(&mut self, event_id: &str) -> bool {
        let matches = self
            .current
            .as_ref()
            .is_some_and(|b| b.processed_event_ids.contains(event_id));
        if matches {
            let cleared = self.current.take();
            if let Some(b) = cleared {
                info!("SCTE-35 IN {} closed break {}", event_id, b.pod_id);
            }
        }
        matches
    }

    /// Operator cue start. Replaces whatever break is live.
    pub fn start_manual(
        &mut self,
        channel_id: &str,
        now_ms: i64,
        duration_sec: f64,
        pod_id: Option<String>,
        pod_url: Option<String>,
    ) -> &AdBreakState {
        let mut state = AdBreakState::new(channel_id, BreakSource::Manual, now_ms, duration_sec, None);
        if let Some(id) = pod_id {
            state.processed_event_ids.insert(id);
        }
        state.pod_url = pod_url;
        info!(
            "Manual break {} on {}: duration={:.3}s",
            state.pod_id, channel_id, state.duration_sec
        );
        self.current = Some(state);
        self.current.as_ref().expect("just set")
    }

    /// Schedule trigger: opens a time-sourced break when the wall-clock
    /// minute is a multiple of five and the slot is empty.
    pub fn maybe_start_scheduled(
        &mut self,
        channel_id: &str,
        now_ms: i64,
        duration_sec: f64,
    ) -> bool {
        if self.current.is_some() {
            return false;
        }
        let minute = (now_ms / 60_000) % 60;
        if minute % 5 != 0 {
            return false;
        }
        let state = AdBreakState::new(channel_id, BreakSource::Time, now_ms, duration_sec, None);
        info!("Scheduled break {} on {}", state.pod_id, channel_id);
        self.current = Some(state);
        true
    }

    /// Operator cue stop.
    pub fn stop(&mut self) -> Option<AdBreakState> {
        self.current.take()
    }
}

/// Tier gate: channel tier 0 matches any signal tier.
pub fn tier_matches(channel_tier: u16, signal_tier: u16) -> bool {
    channel_tier == 0 || channel_tier == signal_tier
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scte35::SignalKind;

    fn signal(event_id: &str, start_ms: i64, duration: f64, tier: u16) -> Scte35Signal {
        Scte35Signal {
            event_id: event_id.to_string(),
            kind: SignalKind::Out,
            pts: None,
            duration_sec: Some(duration),
            tier,
            raw: Vec::new(),
            crc_valid: true,
            upid: None,
            start_ms,
            start_iso: "2026-03-01T12:00:12+00:00".to_string(),
        }
    }

    const T: i64 = 1_772_000_000_000;

    #[test]
    fn pod_id_is_stable_and_derived_from_start() {
        let state = AdBreakState::new("ch1", BreakSource::Scte35, T, 12.0, None);
        assert_eq!(state.pod_id, format!("ad_ch1_{}", T / 1000));
        assert_eq!(state.ends_at, T + 12_000);
    }

    #[test]
    fn duration_is_quantized_to_milliseconds() {
        let state = AdBreakState::new("ch1", BreakSource::Manual, T, 29.999_600_1, None);
        assert_eq!(state.duration_sec, 30.0);
        let state = AdBreakState::new("ch1", BreakSource::Manual, T, 12.3456, None);
        assert_eq!(state.duration_sec, 12.346);
    }

    #[test]
    fn out_opens_break_once_and_dedupes() {
        let mut slot = BreakSlot::default();
        let s = signal("e1", T, 12.0, 0);

        assert_eq!(slot.on_scte35_out("ch1", &s, true, T), OutOutcome::Opened);
        let pod_id = slot.current.as_ref().unwrap().pod_id.clone();
        let version = slot.current.as_ref().unwrap().version;

        // Re-advertised same event id five times: no new break, no state churn
        for _ in 0..5 {
            assert_eq!(slot.on_scte35_out("ch1", &s, true, T), OutOutcome::Duplicate);
        }
        let b = slot.current.as_ref().unwrap();
        assert_eq!(b.pod_id, pod_id);
        assert_eq!(b.version, version);
        assert_eq!(b.processed_event_ids.len(), 1);
    }

    #[test]
    fn proximate_distinct_event_merges() {
        let mut slot = BreakSlot::default();
        slot.on_scte35_out("ch1", &signal("e1", T, 12.0, 0), true, T);
        let pod_id = slot.current.as_ref().unwrap().pod_id.clone();

        let outcome = slot.on_scte35_out("ch1", &signal("e2", T + 30_000, 12.0, 0), true, T + 30_000);
        assert_eq!(outcome, OutOutcome::Merged);
        let b = slot.current.as_ref().unwrap();
        assert_eq!(b.pod_id, pod_id, "break identity unchanged");
        assert!(b.processed_event_ids.contains("e2"));
    }

    #[test]
    fn tier_gate() {
        assert!(tier_matches(0, 0x1F0));
        assert!(tier_matches(0x1F0, 0x1F0));
        assert!(!tier_matches(0x1F0, 0x000));

        let mut slot = BreakSlot::default();
        let outcome = slot.on_scte35_out("ch1", &signal("e1", T, 12.0, 0x000), false, T);
        assert_eq!(outcome, OutOutcome::Ignored);
        assert!(slot.current.is_none());
    }

    #[test]
    fn matching_in_clears_break() {
        let mut slot = BreakSlot::default();
        slot.on_scte35_out("ch1", &signal("e1", T, 60.0, 0), true, T);

        assert!(!slot.on_scte35_in("other-event"));
        assert!(slot.current.is_some());

        assert!(slot.on_scte35_in("e1"));
        assert!(slot.current.is_none());
    }

    #[test]
    fn wall_clock_expiry() {
        let mut slot = BreakSlot::default();
        slot.on_scte35_out("ch1", &signal("e1", T, 12.0, 0), true, T);

        assert!(slot.expire(T + 11_999, 90_000).is_none());
        assert!(slot.expire(T + 12_000, 90_000).is_some());
        assert!(slot.current.is_none());
    }

    #[test]
    fn manifest_window_expiry_applies_to_scte35_only() {
        let mut slot = BreakSlot::default();
        slot.on_scte35_out("ch1", &signal("e1", T, 300.0, 0), true, T);
        assert!(slot.expire(T + 95_000, 90_000).is_some());

        let mut slot = BreakSlot::default();
        slot.start_manual("ch1", T, 300.0, Some("pod-1".to_string()), None);
        assert!(slot.expire(T + 95_000, 90_000).is_none());
    }

    #[test]
    fn skip_plan_binds_once() {
        let mut state = AdBreakState::new("ch1", BreakSource::Scte35, T, 12.0, None);
        state.bind_skip_plan(2, 12.0);
        assert_eq!(state.content_segments_to_skip, 2);

        // Recomputation disagreeing is ignored (and counted as an anomaly)
        state.bind_skip_plan(3, 18.0);
        assert_eq!(state.content_segments_to_skip, 2);
        assert_eq!(state.skipped_duration, 12.0);
    }

    #[test]
    fn decision_ttl() {
        let mut state = AdBreakState::new("ch1", BreakSource::Scte35, T, 12.0, None);
        assert!(!state.decision_fresh(T));

        state.store_decision(
            crate::decision::DecisionResponse {
                pod: crate::decision::AdPod {
                    pod_id: "p".to_string(),
                    duration_sec: 12.0,
                    items: vec![],
                },
                tracking: None,
            },
            T,
        );
        assert!(state.decision_fresh(T + 29_999));
        assert!(!state.decision_fresh(T + 30_001));
    }

    #[test]
    fn version_increments_on_writes() {
        let mut state = AdBreakState::new("ch1", BreakSource::Scte35, T, 12.0, None);
        let v0 = state.version;
        state.absorb_event("e9");
        assert!(state.version > v0);
        let v1 = state.version;
        state.bind_skip_plan(2, 12.0);
        assert!(state.version > v1);
    }

    #[test]
    fn scheduled_break_only_on_five_minute_marks() {
        let mut slot = BreakSlot::default();
        // 12:03 — not a multiple of five
        let t_off = 1_772_000_000_000 / 60_000 * 60_000;
        let minute = (t_off / 60_000) % 60;
        let to_next_5 = (5 - (minute % 5)) % 5;
        let t5 = t_off + to_next_5 * 60_000;
        let t3 = t5 + 3 * 60_000;

        assert!(!slot.maybe_start_scheduled("ch1", t3, 30.0));
        assert!(slot.maybe_start_scheduled("ch1", t5, 30.0));
        assert_eq!(slot.current.as_ref().unwrap().source, BreakSource::Time);
    }
}
