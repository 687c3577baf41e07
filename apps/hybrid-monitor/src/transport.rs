//! Byte sources feeding the frame assembler.
//!
//! Every read is bounded by a timeout so the reader can observe shutdown between chunks.

use crate::error::TransportFault;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const READ_CHUNK_BYTES: usize = 512;
const PORT_PREFIXES: &[&str] = &["ttyACM", "ttyUSB"];
/// Labelled values only; bare dashes are common in unrelated device output.
const FRAME_MARKERS: &[&str] = &["SOL V:", "WND V:", "LUX:"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    Timeout,
    /// The source ended for good (simulator stopped, script exhausted).
    Closed,
}

pub trait FrameTransport: Send {
    fn read_chunk(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportFault>;

    /// Re-establishes the link after a fault. Partial data from before the fault is gone.
    fn reconnect(&mut self) -> Result<(), TransportFault>;

    fn describe(&self) -> String;
}

pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportFault> {
        let mut transport = Self {
            path: path.to_string(),
            baud_rate,
            port: None,
        };
        transport.reconnect()?;
        Ok(transport)
    }
}

impl FrameTransport for SerialTransport {
    fn read_chunk(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportFault> {
        let Some(port) = self.port.as_mut() else {
            return Err(TransportFault::Disconnected(format!("{} is not open", self.path)));
        };
        port.set_timeout(timeout)
            .map_err(|err| TransportFault::Disconnected(format!("{}: {err}", self.path)))?;

        let mut buf = [0u8; READ_CHUNK_BYTES];
        match port.read(&mut buf) {
            Ok(0) => Ok(ReadOutcome::Timeout),
            Ok(n) => Ok(ReadOutcome::Data(buf[..n].to_vec())),
            Err(err) if err.kind() == ErrorKind::TimedOut => Ok(ReadOutcome::Timeout),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(ReadOutcome::Timeout),
            Err(err) => {
                self.port = None;
                Err(TransportFault::Disconnected(format!("{}: {err}", self.path)))
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportFault> {
        self.port = None;
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(|err| TransportFault::Unavailable(format!("open {}: {err}", self.path)))?;
        self.port = Some(port);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("serial {} @ {} baud", self.path, self.baud_rate)
    }
}

/// Lists candidate station ports, most likely first.
pub fn candidate_ports(dev_dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = match std::fs::read_dir(dev_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| PORT_PREFIXES.iter().any(|p| name.starts_with(p)))
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    found.sort_by_key(|path| {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let rank = PORT_PREFIXES
            .iter()
            .position(|p| name.starts_with(p))
            .unwrap_or(PORT_PREFIXES.len());
        (rank, name)
    });
    found
}

pub fn looks_like_station_output(bytes: &[u8]) -> bool {
    let text = String::from_utf8_lossy(bytes);
    FRAME_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Opens the first candidate port whose output contains frame markers within `probe_timeout`.
pub fn detect_port(
    dev_dir: &Path,
    baud_rate: u32,
    probe_timeout: Duration,
) -> Result<SerialTransport, TransportFault> {
    let candidates = candidate_ports(dev_dir);
    if candidates.is_empty() {
        return Err(TransportFault::Unavailable(format!(
            "no ttyACM/ttyUSB devices under {}",
            dev_dir.display()
        )));
    }

    for candidate in candidates {
        let path = candidate.display().to_string();
        let mut transport = match SerialTransport::open(&path, baud_rate) {
            Ok(transport) => transport,
            Err(err) => {
                tracing::debug!(port = %path, error = %err, "skipping port");
                continue;
            }
        };
        let deadline = Instant::now() + probe_timeout;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match transport.read_chunk(Duration::from_millis(250)) {
                Ok(ReadOutcome::Data(bytes)) => {
                    seen.extend_from_slice(&bytes);
                    if looks_like_station_output(&seen) {
                        tracing::info!(port = %path, "detected station output");
                        return Ok(transport);
                    }
                }
                Ok(ReadOutcome::Timeout) => {}
                Ok(ReadOutcome::Closed) | Err(_) => break,
            }
        }
        tracing::debug!(port = %path, bytes = seen.len(), "no frame markers seen");
    }

    Err(TransportFault::Unavailable(
        "no port produced station frames".to_string(),
    ))
}

/// Receives byte chunks from an in-process producer such as the simulator.
pub struct ChannelTransport {
    rx: mpsc::Receiver<Vec<u8>>,
    label: String,
}

impl ChannelTransport {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, label: impl Into<String>) -> Self {
        Self {
            rx,
            label: label.into(),
        }
    }
}

impl FrameTransport for ChannelTransport {
    fn read_chunk(&mut self, timeout: Duration) -> Result<ReadOutcome, TransportFault> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => Ok(ReadOutcome::Data(bytes)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(ReadOutcome::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(ReadOutcome::Closed),
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportFault> {
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptStep, ScriptedTransport};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn candidate_ports_prefers_acm_then_usb() {
        let dir = TempDir::new().unwrap();
        for name in ["ttyUSB0", "ttyS0", "ttyACM1", "ttyACM0", "null"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let names: Vec<String> = candidate_ports(dir.path())
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ttyACM0", "ttyACM1", "ttyUSB0"]);
    }

    #[test]
    fn detect_port_reports_unavailable_without_devices() {
        let dir = TempDir::new().unwrap();
        let result = detect_port(dir.path(), 115_200, Duration::from_millis(10));
        assert!(matches!(result, Err(TransportFault::Unavailable(_))));
    }

    #[test]
    fn station_output_needs_labelled_values() {
        assert!(looks_like_station_output(b"garbage\nSOL V:1.00"));
        assert!(looks_like_station_output(b"LUX:300 FAN:0%"));
        assert!(!looks_like_station_output(b"-------\r\n"));
        assert!(!looks_like_station_output(b"SOLAR CONTROLLER v2\r\n"));
        assert!(!looks_like_station_output(b"AT+OK\r\n"));
    }

    #[test]
    fn scripted_transport_drops_until_reconnected() {
        let mut transport = ScriptedTransport::new([
            ScriptStep::Data(b"a".to_vec()),
            ScriptStep::Disconnect,
            ScriptStep::Data(b"b".to_vec()),
        ])
        .with_failing_reconnects(1);
        let timeout = Duration::from_millis(1);

        assert_eq!(transport.read_chunk(timeout).unwrap(), ReadOutcome::Data(b"a".to_vec()));
        assert!(transport.read_chunk(timeout).is_err());
        assert!(transport.read_chunk(timeout).is_err());
        assert!(transport.reconnect().is_err());
        transport.reconnect().unwrap();
        assert_eq!(transport.read_chunk(timeout).unwrap(), ReadOutcome::Data(b"b".to_vec()));
        assert_eq!(transport.read_chunk(timeout).unwrap(), ReadOutcome::Closed);
        assert_eq!(transport.reconnects, 2);
    }

    #[test]
    fn channel_transport_times_out_then_closes() {
        let (tx, rx) = mpsc::channel();
        let mut transport = ChannelTransport::new(rx, "sim");
        assert_eq!(
            transport.read_chunk(Duration::from_millis(5)).unwrap(),
            ReadOutcome::Timeout
        );
        tx.send(b"xy".to_vec()).unwrap();
        drop(tx);
        assert_eq!(
            transport.read_chunk(Duration::from_millis(5)).unwrap(),
            ReadOutcome::Data(b"xy".to_vec())
        );
        assert_eq!(
            transport.read_chunk(Duration::from_millis(5)).unwrap(),
            ReadOutcome::Closed
        );
    }
}
