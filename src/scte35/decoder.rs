//! SCTE-35 splice_info_section decoding and HLS attribute-form handling.
//!
//! Binary layout per SCTE-35 §9. Only the commands that matter for ad breaks
//! are fully modeled: splice_insert (0x05) and time_signal (0x06) with its
//! segmentation descriptor. Everything else is classified as a bare command.

use super::bit_reader::BitReader;
use super::crc::validate_message_crc;
use crate::error::{AdEdgeError, Result};
use crate::metrics;
use m3u8_rs::{DateRange, MediaPlaylist, QuotedOrUnquoted};
use tracing::{debug, warn};

/// Signals older than this (now − START-DATE) are flagged as possibly stale.
const STALE_AGE_MS: i64 = 180_000;
/// Durations above this are treated as runaway and rejected.
const MAX_DURATION_SECS: f64 = 600.0;
/// PTS values are 33-bit; anything above is out of range.
const PTS_MAX: u64 = 1 << 33;
/// Attribute and binary durations further apart than this count as a conflict.
const DURATION_CONFLICT_SECS: f64 = 0.5;

/// Direction of a parsed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Out,
    In,
    Cmd,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Out => "out",
            SignalKind::In => "in",
            SignalKind::Cmd => "cmd",
        }
    }
}

/// A parsed SCTE-35 signal, normalized across attribute and binary forms.
#[derive(Debug, Clone)]
pub struct Scte35Signal {
    /// Binary splice_event_id when present, otherwise the DATERANGE ID.
    pub event_id: String,
    pub kind: SignalKind,
    /// 90 kHz ticks (pts_time + pts_adjustment), when the command carried one.
    pub pts: Option<u64>,
    pub duration_sec: Option<f64>,
    /// 12-bit tier; 0xFFF means "all tiers" on the wire.
    pub tier: u16,
    /// Raw splice_info bytes; empty for attribute-only signals.
    pub raw: Vec<u8>,
    /// False only when a binary payload failed CRC validation.
    pub crc_valid: bool,
    pub upid: Option<Vec<u8>>,
    /// Wall-clock start taken from the carrying DATERANGE START-DATE.
    pub start_ms: i64,
    pub start_iso: String,
}

impl Scte35Signal {
    /// Implied end of the break, when a duration is known.
    pub fn end_ms(&self) -> Option<i64> {
        self.duration_sec
            .map(|d| self.start_ms + (d * 1000.0).round() as i64)
    }
}

/// Decoded splice_info_section, reduced to the fields the break engine uses.
#[derive(Debug, Clone)]
pub struct SpliceInfo {
    pub tier: u16,
    pub pts_adjustment: u64,
    pub command: SpliceCommand,
    pub crc_valid: bool,
}

#[derive(Debug, Clone)]
pub enum SpliceCommand {
    Null,
    Insert {
        event_id: u32,
        cancel: bool,
        out_of_network: bool,
        pts: Option<u64>,
        duration_sec: Option<f64>,
    },
    TimeSignal {
        pts: Option<u64>,
        descriptors: Vec<SegmentationDescriptor>,
    },
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct SegmentationDescriptor {
    pub event_id: u32,
    pub cancel: bool,
    pub duration_sec: Option<f64>,
    pub type_id: u8,
    pub upid: Vec<u8>,
}

// Segmentation type ids that open and close ad opportunities
const SEG_TYPE_STARTS: &[u8] = &[0x22, 0x30, 0x32, 0x34, 0x36, 0x38, 0x3A, 0x44, 0x46];
const SEG_TYPE_ENDS: &[u8] = &[0x23, 0x31, 0x33, 0x35, 0x37, 0x39, 0x3B, 0x45, 0x47];

/// Parses a binary splice_info_section.
pub fn parse_splice_info(buffer: &[u8]) -> Result<SpliceInfo> {
    let mut reader = BitReader::new(buffer);

    let table_id = reader
        .read_bits(8)
        .map_err(|e| AdEdgeError::Scte35Parse(e.to_string()))?;
    if table_id != 0xFC {
        return Err(AdEdgeError::Scte35Parse(format!(
            "unexpected table_id 0x{:02X}",
            table_id
        )));
    }

    let mut info =
        parse_section(&mut reader).map_err(|e| AdEdgeError::Scte35Parse(e.to_string()))?;

    // CRC failure is surfaced, not fatal; the state machine decides policy
    if !validate_message_crc(buffer) {
        metrics::record_crc_failure();
        warn!("SCTE-35 CRC-32 validation failed");
        info.crc_valid = false;
    }

    Ok(info)
}

fn parse_section(r: &mut BitReader) -> std::io::Result<SpliceInfo> {
    let _section_syntax = r.read_flag()?;
    let _private = r.read_flag()?;
    let _sap_type = r.read_bits(2)?;
    let _section_length = r.read_bits(12)?;
    let _protocol_version = r.read_bits(8)?;
    let encrypted = r.read_flag()?;
    let _encryption_algorithm = r.read_bits(6)?;
    let pts_adjustment = r.read_bits(33)?;
    let _cw_index = r.read_bits(8)?;
    let tier = r.read_bits(12)? as u16;
    let command_length = r.read_bits(12)? as usize;
    let command_type = r.read_bits(8)? as u8;

    if encrypted {
        // Encrypted packets cannot be interpreted; classify and move on
        return Ok(SpliceInfo {
            tier,
            pts_adjustment,
            command: SpliceCommand::Other(command_type),
            crc_valid: false,
        });
    }

    let command_start = r.offset();
    let command = match command_type {
        0x00 => SpliceCommand::Null,
        0x05 => parse_splice_insert(r, pts_adjustment)?,
        0x06 => SpliceCommand::TimeSignal {
            pts: parse_splice_time(r, pts_adjustment)?,
            descriptors: Vec::new(),
        },
        other => {
            r.skip_bits(command_length * 8)?;
            SpliceCommand::Other(other)
        }
    };
    // Commands may leave declared-but-unparsed trailing bytes
    let consumed = r.offset() - command_start;
    if command_length * 8 > consumed {
        r.skip_bits(command_length * 8 - consumed)?;
    }

    let descriptor_loop_length = r.read_bits(16)? as usize;
    let loop_start = r.offset();
    let mut descriptors = Vec::new();
    while r.offset() - loop_start < descriptor_loop_length * 8 {
        let tag = r.read_bits(8)? as u8;
        let length = r.read_bits(8)? as usize;
        if tag == 0x02 {
            if let Some(d) = parse_segmentation_descriptor(r, length)? {
                descriptors.push(d);
            }
        } else {
            r.skip_bits(length * 8)?;
        }
    }

    let command = match command {
        SpliceCommand::TimeSignal { pts, .. } => SpliceCommand::TimeSignal { pts, descriptors },
        other => other,
    };

    Ok(SpliceInfo {
        tier,
        pts_adjustment,
        command,
        crc_valid: true,
    })
}

fn parse_splice_insert(
    r: &mut BitReader,
    pts_adjustment: u64,
) -> std::io::Result<SpliceCommand> {
    let event_id = r.read_bits(32)? as u32;
    let cancel = r.read_flag()?;
    let _reserved = r.read_bits(7)?;

    if cancel {
        return Ok(SpliceCommand::Insert {
            event_id,
            cancel: true,
            out_of_network: false,
            pts: None,
            duration_sec: None,
        });
    }

    let out_of_network = r.read_flag()?;
    let program_splice = r.read_flag()?;
    let duration_flag = r.read_flag()?;
    let splice_immediate = r.read_flag()?;
    let _reserved2 = r.read_bits(4)?;

    let pts = if program_splice && !splice_immediate {
        parse_splice_time(r, pts_adjustment)?
    } else {
        None
    };

    let duration_sec = if duration_flag {
        let _auto_return = r.read_flag()?;
        let _reserved = r.read_bits(6)?;
        let ticks = r.read_bits(33)?;
        Some(ticks as f64 / 90_000.0)
    } else {
        None
    };

    let _unique_program_id = r.read_bits(16)?;
    let _avail_num = r.read_bits(8)?;
    let _avails_expected = r.read_bits(8)?;

    Ok(SpliceCommand::Insert {
        event_id,
        cancel: false,
        out_of_network,
        pts,
        duration_sec,
    })
}

fn parse_splice_time(r: &mut BitReader, pts_adjustment: u64) -> std::io::Result<Option<u64>> {
    let time_specified = r.read_flag()?;
    if time_specified {
        let _reserved = r.read_bits(6)?;
        let pts_time = r.read_bits(33)?;
        Ok(Some(pts_time + pts_adjustment))
    } else {
        let _reserved = r.read_bits(7)?;
        Ok(None)
    }
}

fn parse_segmentation_descriptor(
    r: &mut BitReader,
    length: usize,
) -> std::io::Result<Option<SegmentationDescriptor>> {
    let start = r.offset();
    let max_bits = length * 8;

    let identifier = r.read_bits(32)? as u32;
    if identifier != 0x4355_4549 {
        // Not "CUEI" — skip the remainder of the descriptor
        r.skip_bits(max_bits.saturating_sub(r.offset() - start))?;
        return Ok(None);
    }

    let event_id = r.read_bits(32)? as u32;
    let cancel = r.read_flag()?;
    let _reserved = r.read_bits(7)?;

    if cancel {
        r.skip_bits(max_bits.saturating_sub(r.offset() - start))?;
        return Ok(Some(SegmentationDescriptor {
            event_id,
            cancel: true,
            duration_sec: None,
            type_id: 0,
            upid: Vec::new(),
        }));
    }

    let program_segmentation = r.read_flag()?;
    let duration_flag = r.read_flag()?;
    let _delivery_not_restricted = r.read_bits(1)?;
    let _restriction_bits = r.read_bits(5)?;

    if !program_segmentation {
        let component_count = r.read_bits(8)? as usize;
        // 6 bytes per component: tag + reserved + 33-bit pts offset
        r.skip_bits(component_count * 48)?;
    }

    let duration_sec = if duration_flag {
        let ticks = r.read_bits(40)?;
        Some(ticks as f64 / 90_000.0)
    } else {
        None
    };

    let _upid_type = r.read_bits(8)?;
    let upid_length = r.read_bits(8)? as usize;
    let mut upid = Vec::with_capacity(upid_length);
    for _ in 0..upid_length {
        upid.push(r.read_bits(8)? as u8);
    }

    let type_id = r.read_bits(8)? as u8;
    let _segment_num = r.read_bits(8)?;
    let _segments_expected = r.read_bits(8)?;

    // Some type ids carry sub-segment fields; consume whatever remains
    r.skip_bits(max_bits.saturating_sub(r.offset() - start))?;

    Ok(Some(SegmentationDescriptor {
        event_id,
        cancel: false,
        duration_sec,
        type_id,
        upid,
    }))
}

// ── HLS attribute form ──────────────────────────────────────────────────

fn attr<'a>(dr: &'a DateRange, key: &str) -> Option<&'a QuotedOrUnquoted> {
    dr.other_attributes
        .as_ref()
        .and_then(|m| m.get(key))
        .or_else(|| dr.x_prefixed.as_ref().and_then(|m| m.get(key)))
}

/// True when the DATERANGE is an origin SCTE-35 carrier (as opposed to an
/// interstitial or unrelated metadata range).
pub fn is_scte35_daterange(dr: &DateRange) -> bool {
    if let Some(class) = &dr.class {
        if class.starts_with("scte35") {
            return true;
        }
        if class == "com.apple.hls.interstitial" {
            return false;
        }
    }
    attr(dr, "SCTE35-OUT").is_some()
        || attr(dr, "SCTE35-IN").is_some()
        || attr(dr, "SCTE35-CMD").is_some()
}

/// Decodes a DATERANGE into a normalized signal.
///
/// The binary payload (when present and parseable) takes precedence; the
/// attribute DURATION is used only when the binary carries no duration.
/// A disagreement between the two is surfaced as telemetry.
pub fn decode_daterange(dr: &DateRange) -> Option<Scte35Signal> {
    let start_ms = dr.start_date.timestamp_millis();
    let start_iso = dr.start_date.to_rfc3339();
    let attr_duration = dr.duration.or(dr.planned_duration);

    let (payload_key, attr_kind) = if attr(dr, "SCTE35-OUT").is_some() {
        ("SCTE35-OUT", SignalKind::Out)
    } else if attr(dr, "SCTE35-IN").is_some() {
        ("SCTE35-IN", SignalKind::In)
    } else if attr(dr, "SCTE35-CMD").is_some() {
        ("SCTE35-CMD", SignalKind::Cmd)
    } else {
        // Attribute-only signal: ID/START-DATE/DURATION carry the break
        let kind = if attr_duration.unwrap_or(0.0) > 0.0 {
            SignalKind::Out
        } else {
            SignalKind::Cmd
        };
        return Some(Scte35Signal {
            event_id: dr.id.clone(),
            kind,
            pts: None,
            duration_sec: attr_duration,
            tier: 0,
            raw: Vec::new(),
            crc_valid: true,
            upid: None,
            start_ms,
            start_iso,
        });
    };

    let hex_payload = attr(dr, payload_key)?.as_str();
    let raw = match hex::decode(hex_payload.trim_start_matches("0x")) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Undecodable SCTE-35 hex payload on {}: {}", dr.id, e);
            return Some(Scte35Signal {
                event_id: dr.id.clone(),
                kind: attr_kind,
                pts: None,
                duration_sec: attr_duration,
                tier: 0,
                raw: Vec::new(),
                crc_valid: false,
                upid: None,
                start_ms,
                start_iso,
            });
        }
    };

    match parse_splice_info(&raw) {
        Ok(info) => {
            let mut signal = signal_from_splice_info(&info, start_ms, start_iso, &dr.id);
            signal.raw = raw;
            match (signal.duration_sec, attr_duration) {
                (None, Some(d)) => signal.duration_sec = Some(d),
                (Some(binary), Some(attribute))
                    if (binary - attribute).abs() > DURATION_CONFLICT_SECS =>
                {
                    metrics::record_duration_conflict();
                    warn!(
                        "SCTE-35 duration conflict on {}: binary {:.3}s vs attribute {:.3}s",
                        dr.id, binary, attribute
                    );
                }
                _ => {}
            }
            Some(signal)
        }
        Err(e) => {
            debug!("Binary SCTE-35 parse failed on {}: {}, using attributes", dr.id, e);
            Some(Scte35Signal {
                event_id: dr.id.clone(),
                kind: attr_kind,
                pts: None,
                duration_sec: attr_duration,
                tier: 0,
                raw,
                crc_valid: false,
                upid: None,
                start_ms,
                start_iso,
            })
        }
    }
}

fn signal_from_splice_info(
    info: &SpliceInfo,
    start_ms: i64,
    start_iso: String,
    fallback_id: &str,
) -> Scte35Signal {
    let (event_id, kind, pts, duration_sec, upid) = match &info.command {
        SpliceCommand::Insert {
            event_id,
            cancel,
            out_of_network,
            pts,
            duration_sec,
        } => {
            let kind = if *cancel {
                SignalKind::Cmd
            } else if *out_of_network {
                SignalKind::Out
            } else {
                SignalKind::In
            };
            (event_id.to_string(), kind, *pts, *duration_sec, None)
        }
        SpliceCommand::TimeSignal { pts, descriptors } => {
            // First start/end descriptor decides the direction
            let classified = descriptors.iter().find_map(|d| {
                if SEG_TYPE_STARTS.contains(&d.type_id) {
                    Some((d, SignalKind::Out))
                } else if SEG_TYPE_ENDS.contains(&d.type_id) {
                    Some((d, SignalKind::In))
                } else {
                    None
                }
            });
            match classified {
                Some((d, kind)) => (
                    d.event_id.to_string(),
                    kind,
                    *pts,
                    d.duration_sec,
                    (!d.upid.is_empty()).then(|| d.upid.clone()),
                ),
                None => (fallback_id.to_string(), SignalKind::Cmd, *pts, None, None),
            }
        }
        _ => (fallback_id.to_string(), SignalKind::Cmd, None, None, None),
    };

    Scte35Signal {
        event_id,
        kind,
        pts,
        duration_sec,
        tier: info.tier,
        raw: Vec::new(),
        crc_valid: info.crc_valid,
        upid,
        start_ms,
        start_iso,
    }
}

/// Collects all SCTE-35 signals carried by a media playlist, in order.
pub fn signals_from_playlist(playlist: &MediaPlaylist) -> Vec<Scte35Signal> {
    playlist
        .segments
        .iter()
        .filter_map(|seg| seg.daterange.as_ref())
        .filter(|dr| is_scte35_daterange(dr))
        .filter_map(decode_daterange)
        .collect()
}

// ── Validation & selection ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalValidation {
    Accept,
    /// Accepted but suspicious; carries the warning reasons.
    Warn(Vec<String>),
    Reject(String),
}

/// Sanity-checks a signal against the most recent wall-clock context.
pub fn validate_signal(signal: &Scte35Signal, now_ms: i64) -> SignalValidation {
    if let Some(d) = signal.duration_sec {
        if d <= 0.0 {
            return SignalValidation::Reject(format!("non-positive duration {:.3}s", d));
        }
        if d > MAX_DURATION_SECS {
            return SignalValidation::Reject(format!("runaway duration {:.1}s", d));
        }
    }
    if let Some(pts) = signal.pts {
        if pts > PTS_MAX {
            return SignalValidation::Reject(format!("PTS {} out of 33-bit range", pts));
        }
    }

    let mut warnings = Vec::new();
    let age_ms = now_ms - signal.start_ms;
    if age_ms > STALE_AGE_MS {
        warnings.push(format!("signal is {}s old, possibly stale", age_ms / 1000));
    }
    if !signal.crc_valid {
        warnings.push("CRC validation failed".to_string());
    }

    if warnings.is_empty() {
        SignalValidation::Accept
    } else {
        SignalValidation::Warn(warnings)
    }
}

/// Picks the OUT signal that currently governs the break, if any: the most
/// recent OUT whose implied end is still in the future and that has no
/// matching IN with the same event id later in the window.
pub fn select_active_break<'a>(
    signals: &'a [Scte35Signal],
    now_ms: i64,
) -> Option<&'a Scte35Signal> {
    let candidate = signals
        .iter()
        .filter(|s| s.kind == SignalKind::Out)
        .filter(|s| s.end_ms().is_none_or(|end| end >= now_ms))
        .max_by_key(|s| s.start_ms)?;

    let terminated = signals.iter().any(|s| {
        s.kind == SignalKind::In
            && s.event_id == candidate.event_id
            && s.start_ms > candidate.start_ms
    });

    (!terminated).then_some(candidate)
}

// ── Test fixtures ───────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testutil {
    //! Builders for well-formed binary payloads used across the test suite.

    use crate::scte35::crc::checksum;

    struct BitWriter {
        bytes: Vec<u8>,
        bit_len: usize,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bit_len: 0,
            }
        }

        fn put(&mut self, value: u64, num_bits: usize) {
            for i in (0..num_bits).rev() {
                let bit = (value >> i) & 1;
                if self.bit_len % 8 == 0 {
                    self.bytes.push(0);
                }
                let byte = self.bytes.last_mut().unwrap();
                *byte |= (bit as u8) << (7 - (self.bit_len % 8));
                self.bit_len += 1;
            }
        }
    }

    /// Builds a complete splice_insert section with valid CRC.
    pub fn build_splice_insert(
        event_id: u32,
        out_of_network: bool,
        duration_sec: Option<f64>,
        tier: u16,
    ) -> Vec<u8> {
        let mut body = BitWriter::new();
        body.put(event_id as u64, 32);
        body.put(0, 1); // cancel
        body.put(0x7F, 7); // reserved
        body.put(out_of_network as u64, 1);
        body.put(1, 1); // program_splice
        body.put(duration_sec.is_some() as u64, 1);
        body.put(1, 1); // splice_immediate (no splice_time field)
        body.put(0xF, 4); // reserved
        if let Some(d) = duration_sec {
            body.put(1, 1); // auto_return
            body.put(0x3F, 6); // reserved
            body.put((d * 90_000.0).round() as u64, 33);
        }
        body.put(0, 16); // unique_program_id
        body.put(0, 8); // avail_num
        body.put(0, 8); // avails_expected
        let command = body.bytes;

        let mut section = BitWriter::new();
        // Everything after section_length: 11 header bytes + command + 2-byte
        // descriptor loop length + 4-byte CRC
        let section_length = 11 + command.len() + 2 + 4;
        section.put(0xFC, 8); // table_id
        section.put(0, 1); // section_syntax_indicator
        section.put(0, 1); // private
        section.put(0x3, 2); // sap_type (not specified)
        section.put(section_length as u64, 12);
        section.put(0, 8); // protocol_version
        section.put(0, 1); // encrypted
        section.put(0, 6); // encryption_algorithm
        section.put(0, 33); // pts_adjustment
        section.put(0, 8); // cw_index
        section.put(tier as u64, 12);
        section.put(command.len() as u64, 12);
        section.put(0x05, 8); // splice_insert
        for b in &command {
            section.put(*b as u64, 8);
        }
        section.put(0, 16); // descriptor_loop_length

        let mut bytes = section.bytes;
        let crc = checksum(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::build_splice_insert;
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn daterange_with(id: &str, attrs: Vec<(&str, &str)>, duration: Option<f64>) -> DateRange {
        use std::collections::HashMap;
        let mut other = HashMap::new();
        for (k, v) in attrs {
            other.insert(k.to_string(), QuotedOrUnquoted::Unquoted(v.to_string()));
        }
        DateRange {
            id: id.to_string(),
            class: None,
            start_date: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
                .unwrap(),
            end_date: None,
            duration,
            planned_duration: None,
            x_prefixed: None,
            end_on_next: false,
            other_attributes: (!other.is_empty()).then_some(other),
        }
    }

    #[test]
    fn binary_splice_insert_round_trip() {
        let raw = build_splice_insert(1234, true, Some(30.0), 0x100);
        let info = parse_splice_info(&raw).unwrap();

        assert!(info.crc_valid);
        assert_eq!(info.tier, 0x100);
        match info.command {
            SpliceCommand::Insert {
                event_id,
                out_of_network,
                duration_sec,
                ..
            } => {
                assert_eq!(event_id, 1234);
                assert!(out_of_network);
                assert_eq!(duration_sec, Some(30.0));
            }
            other => panic!("expected Insert, got {:?}", other),
        }
    }

    #[test]
    fn corrupted_crc_is_flagged_not_fatal() {
        let mut raw = build_splice_insert(1234, true, Some(30.0), 0);
        let len = raw.len();
        raw[len - 1] ^= 0xFF;

        let info = parse_splice_info(&raw).unwrap();
        assert!(!info.crc_valid);
        assert!(matches!(info.command, SpliceCommand::Insert { .. }));
    }

    #[test]
    fn wrong_table_id_is_an_error() {
        let mut raw = build_splice_insert(1, true, Some(10.0), 0);
        raw[0] = 0xAB;
        assert!(parse_splice_info(&raw).is_err());
    }

    #[test]
    fn splice_in_classification() {
        let raw = build_splice_insert(77, false, None, 0);
        let info = parse_splice_info(&raw).unwrap();
        match info.command {
            SpliceCommand::Insert {
                out_of_network, ..
            } => assert!(!out_of_network),
            other => panic!("expected Insert, got {:?}", other),
        }
    }

    #[test]
    fn daterange_binary_form_prefers_binary_fields() {
        let raw = build_splice_insert(555, true, Some(12.0), 0x1F0);
        let hex_payload = format!("0x{}", hex::encode(&raw));
        // Attribute DURATION deliberately different but within conflict bounds
        let dr = daterange_with("e-attr", vec![("SCTE35-OUT", hex_payload.as_str())], Some(12.2));

        let signal = decode_daterange(&dr).unwrap();
        assert_eq!(signal.event_id, "555");
        assert_eq!(signal.kind, SignalKind::Out);
        assert_eq!(signal.duration_sec, Some(12.0));
        assert_eq!(signal.tier, 0x1F0);
        assert!(signal.crc_valid);
    }

    #[test]
    fn daterange_attribute_duration_fills_missing_binary_duration() {
        let raw = build_splice_insert(9, true, None, 0);
        let hex_payload = format!("0x{}", hex::encode(&raw));
        let dr = daterange_with("e9", vec![("SCTE35-OUT", hex_payload.as_str())], Some(15.0));

        let signal = decode_daterange(&dr).unwrap();
        assert_eq!(signal.duration_sec, Some(15.0));
    }

    #[test]
    fn daterange_attribute_only() {
        let dr = daterange_with("e1", vec![], Some(12.0));
        let signal = decode_daterange(&dr).unwrap();

        assert_eq!(signal.event_id, "e1");
        assert_eq!(signal.kind, SignalKind::Out);
        assert_eq!(signal.duration_sec, Some(12.0));
        assert!(signal.crc_valid);
        assert!(signal.raw.is_empty());
    }

    #[test]
    fn validation_rejects_runaway_duration() {
        let dr = daterange_with("e1", vec![], Some(700.0));
        let signal = decode_daterange(&dr).unwrap();
        let now = signal.start_ms;
        assert!(matches!(
            validate_signal(&signal, now),
            SignalValidation::Reject(_)
        ));
    }

    #[test]
    fn validation_warns_on_stale_signal() {
        let dr = daterange_with("e1", vec![], Some(30.0));
        let signal = decode_daterange(&dr).unwrap();
        let now = signal.start_ms + 200_000;
        match validate_signal(&signal, now) {
            SignalValidation::Warn(reasons) => {
                assert!(reasons.iter().any(|r| r.contains("stale")));
            }
            other => panic!("expected Warn, got {:?}", other),
        }
    }

    #[test]
    fn active_break_selection_ignores_expired() {
        let dr = daterange_with("e1", vec![], Some(10.0));
        let signal = decode_daterange(&dr).unwrap();
        let signals = vec![signal.clone()];

        // In-window: selected
        assert!(select_active_break(&signals, signal.start_ms + 5_000).is_some());
        // Past implied end: not selected
        assert!(select_active_break(&signals, signal.start_ms + 20_000).is_none());
    }

    #[test]
    fn matching_in_terminates_break() {
        let out = decode_daterange(&daterange_with("e1", vec![], Some(60.0))).unwrap();
        let mut signal_in = out.clone();
        signal_in.kind = SignalKind::In;
        signal_in.start_ms = out.start_ms + 30_000;
        signal_in.duration_sec = None;

        let signals = vec![out.clone(), signal_in];
        assert!(select_active_break(&signals, out.start_ms + 40_000).is_none());
    }
}
