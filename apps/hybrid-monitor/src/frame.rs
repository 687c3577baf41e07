//! Text framing for the station link.
//!
//! A frame spans several lines, each optionally prefixed with a source token, and ends with a
//! dashed separator line:
//!
//! ```text
//! SOL V:18.50 I:1200
//! WND V:12.30 I:0.500
//! SP:22.20 WP:6.15
//! LUX:45000 FAN:75%
//! --------------------------
//! ```
//!
//! Fields are extracted by `(source, label)` key through [`FIELD_TABLE`], never by position.

use crate::error::FrameError;
use crate::telemetry::RawFrame;
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const SEPARATOR: &str = "--------------------------";
const SEPARATOR_MARKER: &str = "---";

const DEFAULT_MAX_LINE_BYTES: usize = 256;
const DEFAULT_MAX_LINES_PER_FRAME: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    SolarVoltage,
    SolarCurrent,
    WindVoltage,
    WindCurrent,
    SolarPower,
    WindPower,
    Lux,
    FanDuty,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub field: Field,
    pub name: &'static str,
    /// Line prefix token, `None` for unprefixed labels.
    pub source: Option<&'static str>,
    pub label: &'static str,
    /// Multiplier from wire units to SI units.
    pub scale: f64,
    pub suffix: Option<char>,
    /// Decimal places emitted on the wire.
    pub decimals: usize,
    /// Physical bounds in SI units.
    pub min: f64,
    pub max: f64,
    pub required: bool,
}

impl FieldSpec {
    /// Largest decode error introduced by wire rounding, in SI units.
    pub fn precision(&self) -> f64 {
        0.5 * 10f64.powi(-(self.decimals as i32)) * self.scale
    }
}

pub const FIELD_TABLE: &[FieldSpec] = &[
    FieldSpec {
        field: Field::SolarVoltage,
        name: "v_pv",
        source: Some("SOL"),
        label: "V",
        scale: 1.0,
        suffix: None,
        decimals: 2,
        min: 0.0,
        max: 60.0,
        required: true,
    },
    FieldSpec {
        field: Field::SolarCurrent,
        name: "i_pv",
        source: Some("SOL"),
        label: "I",
        scale: 0.001,
        suffix: None,
        decimals: 0,
        min: 0.0,
        max: 20.0,
        required: true,
    },
    FieldSpec {
        field: Field::WindVoltage,
        name: "v_wind",
        source: Some("WND"),
        label: "V",
        scale: 1.0,
        suffix: None,
        decimals: 2,
        min: 0.0,
        max: 60.0,
        required: false,
    },
    FieldSpec {
        field: Field::WindCurrent,
        name: "i_wind",
        source: Some("WND"),
        label: "I",
        scale: 1.0,
        suffix: None,
        decimals: 3,
        min: 0.0,
        max: 20.0,
        required: false,
    },
    FieldSpec {
        field: Field::SolarPower,
        name: "p_solar",
        source: None,
        label: "SP",
        scale: 1.0,
        suffix: None,
        decimals: 2,
        min: 0.0,
        max: 2000.0,
        required: false,
    },
    FieldSpec {
        field: Field::WindPower,
        name: "p_wind",
        source: None,
        label: "WP",
        scale: 1.0,
        suffix: None,
        decimals: 2,
        min: 0.0,
        max: 2000.0,
        required: false,
    },
    FieldSpec {
        field: Field::Lux,
        name: "lux",
        source: None,
        label: "LUX",
        scale: 1.0,
        suffix: None,
        decimals: 0,
        min: 0.0,
        max: 200_000.0,
        required: true,
    },
    FieldSpec {
        field: Field::FanDuty,
        name: "fan_pwm",
        source: None,
        label: "FAN",
        scale: 1.0,
        suffix: Some('%'),
        decimals: 0,
        min: 0.0,
        max: 100.0,
        required: true,
    },
];

pub fn field_spec(field: Field) -> &'static FieldSpec {
    let index = match field {
        Field::SolarVoltage => 0,
        Field::SolarCurrent => 1,
        Field::WindVoltage => 2,
        Field::WindCurrent => 3,
        Field::SolarPower => 4,
        Field::WindPower => 5,
        Field::Lux => 6,
        Field::FanDuty => 7,
    };
    &FIELD_TABLE[index]
}

fn lookup(source: Option<&str>, label: &str) -> Option<&'static FieldSpec> {
    FIELD_TABLE
        .iter()
        .find(|spec| spec.source == source && spec.label == label)
}

/// Decoded field values in SI units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    values: BTreeMap<Field, f64>,
}

impl FieldMap {
    pub fn get(&self, field: Field) -> Option<f64> {
        self.values.get(&field).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn required(&self, field: Field) -> Result<f64, FrameError> {
        self.get(field).ok_or_else(|| {
            FrameError::MalformedFrame(format!("missing {}", field_spec(field).name))
        })
    }

    pub fn to_raw_frame(&self) -> Result<RawFrame, FrameError> {
        Ok(RawFrame {
            v_pv: self.required(Field::SolarVoltage)?,
            i_pv: self.required(Field::SolarCurrent)?,
            v_wind: self.get(Field::WindVoltage),
            i_wind: self.get(Field::WindCurrent),
            lux: self.required(Field::Lux)?,
            fan_pwm: self.required(Field::FanDuty)?,
        })
    }
}

/// Decodes one complete frame. Pure: a rejected frame has no effect anywhere.
pub fn parse_frame(raw: &[u8]) -> Result<FieldMap, FrameError> {
    let text = String::from_utf8_lossy(raw);
    let mut values = BTreeMap::new();

    for line in text.lines() {
        let mut tokens = line.split_whitespace().peekable();
        let source = match tokens.peek() {
            Some(first) if !first.contains(':') => tokens.next(),
            _ => None,
        };
        for token in tokens {
            let Some((label, raw_value)) = token.split_once(':') else {
                continue;
            };
            let Some(spec) = lookup(source, label) else {
                continue;
            };
            let value = decode_value(spec, raw_value)?;
            // Repeated keys mean two cycles ran together past a lost separator.
            if values.insert(spec.field, value).is_some() {
                return Err(FrameError::MalformedFrame(format!("duplicate {}", spec.name)));
            }
        }
    }

    for spec in FIELD_TABLE.iter().filter(|spec| spec.required) {
        if !values.contains_key(&spec.field) {
            return Err(FrameError::MalformedFrame(format!("missing {}", spec.name)));
        }
    }
    if values.contains_key(&Field::WindVoltage) != values.contains_key(&Field::WindCurrent) {
        return Err(FrameError::MalformedFrame(
            "wind voltage and current must be reported together".to_string(),
        ));
    }

    for spec in FIELD_TABLE {
        if let Some(&value) = values.get(&spec.field) {
            if value < spec.min || value > spec.max {
                return Err(FrameError::OutOfRange {
                    field: spec.name,
                    value,
                    min: spec.min,
                    max: spec.max,
                });
            }
        }
    }

    Ok(FieldMap { values })
}

fn decode_value(spec: &FieldSpec, raw_value: &str) -> Result<f64, FrameError> {
    let trimmed = match spec.suffix {
        Some(suffix) => raw_value.trim_end_matches(suffix),
        None => raw_value,
    };
    let parsed: f64 = trimmed.parse().map_err(|_| {
        FrameError::MalformedFrame(format!("unparseable {} value {raw_value:?}", spec.name))
    })?;
    if !parsed.is_finite() {
        return Err(FrameError::MalformedFrame(format!(
            "non-finite {} value {raw_value:?}",
            spec.name
        )));
    }
    Ok(parsed * spec.scale)
}

/// Renders a frame at the wire precision declared in [`FIELD_TABLE`].
pub fn encode_frame(frame: &RawFrame) -> String {
    let mut out = String::with_capacity(128);
    let _ = writeln!(out, "SOL V:{:.2} I:{:.0}", frame.v_pv, frame.i_pv * 1000.0);
    let wind_power = frame.wind_power_w();
    if let (Some(v), Some(i)) = (frame.v_wind, frame.i_wind) {
        let _ = writeln!(out, "WND V:{v:.2} I:{i:.3}");
    }
    match wind_power {
        Some(wp) => {
            let _ = writeln!(out, "SP:{:.2} WP:{wp:.2}", frame.solar_power_w());
        }
        None => {
            let _ = writeln!(out, "SP:{:.2}", frame.solar_power_w());
        }
    }
    let _ = writeln!(out, "LUX:{:.0} FAN:{:.0}%", frame.lux, frame.fan_pwm);
    out.push_str(SEPARATOR);
    out.push('\n');
    out
}

/// Reassembles frames from arbitrarily split reads.
///
/// Bytes are buffered until a newline; lines accumulate until a separator line closes the
/// frame. Oversized lines and runaway frames are discarded so the stream resynchronizes on
/// the next separator.
#[derive(Debug)]
pub struct FrameAssembler {
    line_buf: Vec<u8>,
    lines: Vec<String>,
    max_line_bytes: usize,
    max_lines: usize,
    overflowed_line: bool,
    discarded: u64,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES, DEFAULT_MAX_LINES_PER_FRAME)
    }
}

impl FrameAssembler {
    pub fn new(max_line_bytes: usize, max_lines: usize) -> Self {
        Self {
            line_buf: Vec::with_capacity(max_line_bytes),
            lines: Vec::new(),
            max_line_bytes: max_line_bytes.max(16),
            max_lines: max_lines.max(1),
            overflowed_line: false,
            discarded: 0,
        }
    }

    /// Number of partial frames or lines thrown away while resynchronizing.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drops any partially received frame, e.g. after the link was re-established.
    pub fn reset(&mut self) {
        if !self.lines.is_empty() || !self.line_buf.is_empty() {
            self.discarded += 1;
        }
        self.line_buf.clear();
        self.lines.clear();
        self.overflowed_line = false;
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                if let Some(frame) = self.finish_line() {
                    frames.push(frame);
                }
                continue;
            }
            if self.overflowed_line {
                continue;
            }
            if self.line_buf.len() >= self.max_line_bytes {
                self.overflowed_line = true;
                self.line_buf.clear();
                self.discarded += 1;
                continue;
            }
            self.line_buf.push(byte);
        }
        frames
    }

    fn finish_line(&mut self) -> Option<Vec<u8>> {
        if self.overflowed_line {
            self.overflowed_line = false;
            return None;
        }
        let line = String::from_utf8_lossy(&self.line_buf).trim().to_string();
        self.line_buf.clear();
        if line.is_empty() {
            return None;
        }
        if line.contains(SEPARATOR_MARKER) {
            if self.lines.is_empty() {
                return None;
            }
            let frame = self.lines.join("\n").into_bytes();
            self.lines.clear();
            return Some(frame);
        }
        if self.lines.len() >= self.max_lines {
            tracing::debug!(lines = self.lines.len(), "frame exceeded line limit; resyncing");
            self.lines.clear();
            self.discarded += 1;
        }
        self.lines.push(line);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "SOL V:18.50 I:1200\nWND V:12.30 I:0.500\nSP:22.20 WP:6.15\nLUX:45000 FAN:75%\n--------------------------\n";

    fn sample_frame() -> RawFrame {
        RawFrame {
            v_pv: 18.5,
            i_pv: 1.2,
            v_wind: Some(12.3),
            i_wind: Some(0.5),
            lux: 45000.0,
            fan_pwm: 61.5,
        }
    }

    #[test]
    fn parses_station_frame_by_label() {
        let mut assembler = FrameAssembler::default();
        let frames = assembler.push(SAMPLE.as_bytes());
        assert_eq!(frames.len(), 1);

        let fields = parse_frame(&frames[0]).unwrap();
        assert_eq!(fields.get(Field::SolarVoltage), Some(18.5));
        assert!((fields.get(Field::SolarCurrent).unwrap() - 1.2).abs() < 1e-12);
        assert_eq!(fields.get(Field::WindCurrent), Some(0.5));
        assert_eq!(fields.get(Field::FanDuty), Some(75.0));
        assert_eq!(fields.get(Field::WindPower), Some(6.15));
    }

    #[test]
    fn field_order_within_and_across_lines_does_not_matter() {
        let raw = b"FAN:10% LUX:300\nSOL I:500 V:12.00";
        let fields = parse_frame(raw).unwrap();
        assert_eq!(fields.get(Field::SolarVoltage), Some(12.0));
        assert_eq!(fields.get(Field::Lux), Some(300.0));
    }

    #[test]
    fn encoded_frame_decodes_within_declared_precision() {
        let frame = RawFrame {
            v_pv: 17.236,
            i_pv: 0.84129,
            v_wind: Some(9.8765),
            i_wind: Some(0.33333),
            lux: 51234.4,
            fan_pwm: 49.38,
        };
        let encoded = encode_frame(&frame);
        let mut assembler = FrameAssembler::default();
        let frames = assembler.push(encoded.as_bytes());
        let decoded = parse_frame(&frames[0]).unwrap().to_raw_frame().unwrap();

        let close = |field: Field, a: f64, b: f64| {
            let tol = field_spec(field).precision() + 1e-9;
            assert!((a - b).abs() <= tol, "{field:?}: {a} vs {b} (tol {tol})");
        };
        close(Field::SolarVoltage, frame.v_pv, decoded.v_pv);
        close(Field::SolarCurrent, frame.i_pv, decoded.i_pv);
        close(Field::WindVoltage, frame.v_wind.unwrap(), decoded.v_wind.unwrap());
        close(Field::WindCurrent, frame.i_wind.unwrap(), decoded.i_wind.unwrap());
        close(Field::Lux, frame.lux, decoded.lux);
        close(Field::FanDuty, frame.fan_pwm, decoded.fan_pwm);
    }

    #[test]
    fn degraded_wind_frame_omits_wind_fields() {
        let mut frame = sample_frame();
        frame.v_wind = None;
        frame.i_wind = None;
        let encoded = encode_frame(&frame);
        assert!(!encoded.contains("WND"));

        let decoded = parse_frame(encoded.as_bytes()).unwrap().to_raw_frame().unwrap();
        assert_eq!(decoded.v_wind, None);
        assert_eq!(decoded.i_wind, None);
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let err = parse_frame(b"SOL V:18.50 I:1200\nLUX:45000").unwrap_err();
        assert_eq!(err, FrameError::MalformedFrame("missing fan_pwm".to_string()));
    }

    #[test]
    fn unpaired_wind_field_is_malformed() {
        let err = parse_frame(b"SOL V:18.50 I:1200\nWND V:3.00\nLUX:1 FAN:0%").unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame(_)));
    }

    #[test]
    fn garbage_value_is_malformed() {
        for raw in [
            &b"SOL V:abc I:1200\nLUX:1 FAN:0%"[..],
            &b"SOL V:NaN I:1200\nLUX:1 FAN:0%"[..],
            &b"SOL V:inf I:1200\nLUX:1 FAN:0%"[..],
        ] {
            assert!(matches!(parse_frame(raw), Err(FrameError::MalformedFrame(_))));
        }
    }

    #[test]
    fn negative_lux_is_out_of_range() {
        let err = parse_frame(b"SOL V:18.50 I:1200\nLUX:-5 FAN:0%").unwrap_err();
        assert!(matches!(err, FrameError::OutOfRange { field: "lux", .. }));
    }

    #[test]
    fn implausible_voltage_is_out_of_range() {
        let err = parse_frame(b"SOL V:480.00 I:1200\nLUX:5 FAN:0%").unwrap_err();
        assert!(matches!(err, FrameError::OutOfRange { field: "v_pv", .. }));
    }

    #[test]
    fn field_spec_matches_table_entry() {
        for spec in FIELD_TABLE {
            assert_eq!(field_spec(spec.field).field, spec.field);
        }
    }

    #[test]
    fn repeated_label_is_malformed() {
        let err = parse_frame(b"SOL V:18.50 I:1200\nLUX:1 FAN:0% LUX:2").unwrap_err();
        assert_eq!(err, FrameError::MalformedFrame("duplicate lux".to_string()));
    }

    #[test]
    fn frames_merged_by_a_lost_separator_are_rejected() {
        let first = SAMPLE.replace("--------------------------\n", "");
        let stream = format!("{first}{SAMPLE}");
        let mut assembler = FrameAssembler::default();
        let frames = assembler.push(stream.as_bytes());
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            parse_frame(&frames[0]),
            Err(FrameError::MalformedFrame(msg)) if msg.starts_with("duplicate")
        ));
    }

    #[test]
    fn unknown_labels_are_ignored() {
        let fields = parse_frame(b"SOL V:1.00 I:0 T:25.1\nLUX:1 FAN:0% RSSI:-60").unwrap();
        assert_eq!(fields.len(), 4);
    }

    #[test]
    fn reassembles_frames_split_across_reads() {
        let stream = format!("{SAMPLE}{SAMPLE}");
        let bytes = stream.as_bytes();
        let mut assembler = FrameAssembler::default();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(7) {
            frames.extend(assembler.push(chunk));
        }
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| parse_frame(f).is_ok()));
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let stream = SAMPLE.replace('\n', "\r\n");
        let mut assembler = FrameAssembler::default();
        let frames = assembler.push(stream.as_bytes());
        assert_eq!(frames.len(), 1);
        assert!(parse_frame(&frames[0]).is_ok());
    }

    #[test]
    fn joining_mid_frame_yields_a_rejectable_fragment_then_resyncs() {
        let tail = "LUX:45000 FAN:75%\n--------------------------\n";
        let stream = format!("{tail}{SAMPLE}");
        let mut assembler = FrameAssembler::default();
        let frames = assembler.push(stream.as_bytes());
        assert_eq!(frames.len(), 2);
        assert!(parse_frame(&frames[0]).is_err());
        assert!(parse_frame(&frames[1]).is_ok());
    }

    #[test]
    fn runaway_frame_without_separator_is_discarded() {
        let mut assembler = FrameAssembler::new(64, 4);
        let mut noise = String::new();
        for _ in 0..5 {
            noise.push_str("NOISE\n");
        }
        assert!(assembler.push(noise.as_bytes()).is_empty());
        assert!(assembler.discarded() >= 1);

        let frames = assembler.push(SAMPLE.as_bytes());
        assert_eq!(frames.len(), 1);
        assert!(parse_frame(&frames[0]).is_err());
        let frames = assembler.push(SAMPLE.as_bytes());
        assert!(parse_frame(&frames[0]).is_ok());
    }

    #[test]
    fn oversized_line_is_dropped() {
        let mut assembler = FrameAssembler::new(32, 10);
        let long = format!("{}\n", "X".repeat(100));
        assert!(assembler.push(long.as_bytes()).is_empty());
        let frames = assembler.push(SAMPLE.as_bytes());
        assert_eq!(frames.len(), 1);
        assert!(parse_frame(&frames[0]).is_ok());
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(b"SOL V:18.50 I:1200\nWND V:1").is_empty());
        assembler.reset();
        let frames = assembler.push(b"LUX:1 FAN:0%\n---\n");
        assert_eq!(frames.len(), 1);
        assert!(matches!(parse_frame(&frames[0]), Err(FrameError::MalformedFrame(_))));
    }
}
