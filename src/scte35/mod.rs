//! SCTE-35 signal decoding.
//!
//! Signals arrive in two forms inside HLS DATERANGE tags: an attribute form
//! (`SCTE35-OUT`/`SCTE35-IN`/`SCTE35-CMD` hex payloads, or plain
//! ID/START-DATE/DURATION attributes) and the binary splice_info_section the
//! hex encodes. The binary form is preferred when both parse; the attribute
//! duration fills in when the binary carries none.

mod bit_reader;
pub mod crc;
pub mod decoder;

pub use decoder::{
    decode_daterange, select_active_break, signals_from_playlist, validate_signal, Scte35Signal,
    SignalKind, SignalValidation, SpliceCommand, SpliceInfo,
};
