use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info};

use crate::error::{Result, StreamError};
use crate::traits::{lock, remaining, wait_until_disconnected, Stream, StreamConfig};

/// Port timeout used while waiting for data, so a disconnect is noticed.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Stand-in for "no write timeout"; the serial driver always needs one.
const UNBOUNDED_WRITE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Line settings for a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub data_bits: DataBits,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            parity: Parity::None,
            stop_bits: StopBits::One,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    /// `NONE`, `ODD` or `EVEN`.
    pub fn with_parity(mut self, parity: &str) -> Result<Self> {
        self.parity = match parity.to_ascii_uppercase().as_str() {
            "NONE" => Parity::None,
            "ODD" => Parity::Odd,
            "EVEN" => Parity::Even,
            other => {
                return Err(StreamError::InvalidConfig(format!(
                    "invalid parity {other}, must be NONE, ODD or EVEN"
                )))
            }
        };
        Ok(self)
    }

    pub fn with_stop_bits(mut self, stop_bits: u8) -> Result<Self> {
        self.stop_bits = match stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(StreamError::InvalidConfig(format!(
                    "invalid stop bits {other}, must be 1 or 2"
                )))
            }
        };
        Ok(self)
    }

    pub fn with_data_bits(mut self, data_bits: u8) -> Result<Self> {
        self.data_bits = match data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(StreamError::InvalidConfig(format!(
                    "invalid data bits {other}, must be 5 through 8"
                )))
            }
        };
        Ok(self)
    }

    /// `NONE` or `RTSCTS` (`RTS_CTS` accepted).
    pub fn with_flow_control(mut self, flow_control: &str) -> Result<Self> {
        self.flow_control = match flow_control.to_ascii_uppercase().as_str() {
            "NONE" => FlowControl::None,
            "RTSCTS" | "RTS_CTS" => FlowControl::Hardware,
            other => {
                return Err(StreamError::InvalidConfig(format!(
                    "invalid flow control {other}, must be NONE or RTSCTS"
                )))
            }
        };
        Ok(self)
    }
}

/// Serial device link. The same device may serve both directions, or
/// separate devices may be named for writing and reading.
pub struct SerialStream {
    write_port: Option<String>,
    read_port: Option<String>,
    serial: SerialConfig,
    config: StreamConfig,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialStream")
            .field("write_port", &self.write_port)
            .field("read_port", &self.read_port)
            .field("serial", &self.serial)
            .field("connected", &self.connected())
            .finish_non_exhaustive()
    }
}

impl SerialStream {
    pub fn new(
        write_port: Option<String>,
        read_port: Option<String>,
        serial: SerialConfig,
        config: StreamConfig,
    ) -> Result<Self> {
        if write_port.is_none() && read_port.is_none() {
            return Err(StreamError::InvalidConfig(
                "serial stream needs a write port or a read port".to_string(),
            ));
        }
        Ok(Self {
            write_port,
            read_port,
            serial,
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn open(&self, path: &str, timeout: Duration) -> Result<Box<dyn SerialPort>> {
        let port = serialport::new(path, self.serial.baud_rate)
            .data_bits(self.serial.data_bits)
            .parity(self.serial.parity)
            .stop_bits(self.serial.stop_bits)
            .flow_control(self.serial.flow_control)
            .timeout(timeout)
            .open()?;
        info!(path, baud = self.serial.baud_rate, "opened serial port");
        Ok(port)
    }
}

impl Stream for SerialStream {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn connect(&self) -> Result<()> {
        self.disconnect();

        let write_timeout = self.config.write_timeout.unwrap_or(UNBOUNDED_WRITE_TIMEOUT);
        let writer = match &self.write_port {
            Some(path) => Some(self.open(path, write_timeout)?),
            None => None,
        };
        let reader = match (&self.read_port, &writer) {
            (Some(path), Some(writer)) if self.write_port.as_ref() == Some(path) => {
                let mut reader = writer.try_clone()?;
                reader.set_timeout(READ_POLL_INTERVAL)?;
                Some(reader)
            }
            (Some(path), _) => Some(self.open(path, READ_POLL_INTERVAL)?),
            (None, _) => None,
        };

        *lock(&self.writer) = writer;
        *lock(&self.reader) = reader;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn read(&self) -> Result<BytesMut> {
        if !self.connected() {
            return Err(StreamError::NotConnected);
        }
        let mut reader = lock(&self.reader);
        let Some(port) = reader.as_mut() else {
            drop(reader);
            return wait_until_disconnected(|| self.connected());
        };

        let deadline = self.config.read_timeout.map(|timeout| Instant::now() + timeout);
        let mut buf = vec![0u8; self.config.read_chunk_size];
        loop {
            if !self.connected() {
                return Err(StreamError::Closed);
            }
            match port.read(&mut buf) {
                Ok(n) if n > 0 => return Ok(BytesMut::from(&buf[..n])),
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(err) => return Err(StreamError::from_io(err)),
            }
            if remaining(deadline).is_some_and(|left| left.is_zero()) {
                return Err(StreamError::Timeout);
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if !self.connected() {
            return Err(StreamError::NotConnected);
        }
        let mut writer = lock(&self.writer);
        let port = writer.as_mut().ok_or_else(|| {
            StreamError::InvalidConfig("write attempted on a read only serial stream".to_string())
        })?;
        port.write_all(data).map_err(StreamError::from_io)?;
        port.flush().map_err(StreamError::from_io)
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        lock(&self.writer).take();
        // A blocked reader holds its lock; it sees the flag on its next poll.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        debug!(write_port = ?self.write_port, read_port = ?self.read_port, "serial stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_settings_parse() {
        let config = SerialConfig::new(9600)
            .with_parity("even")
            .unwrap()
            .with_stop_bits(2)
            .unwrap()
            .with_data_bits(7)
            .unwrap()
            .with_flow_control("RTS_CTS")
            .unwrap();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.stop_bits, StopBits::Two);
        assert_eq!(config.data_bits, DataBits::Seven);
        assert_eq!(config.flow_control, FlowControl::Hardware);
    }

    #[test]
    fn test_line_settings_reject_invalid() {
        let config = SerialConfig::default();
        assert!(config.with_parity("MARK").is_err());
        assert!(config.with_stop_bits(3).is_err());
        assert!(config.with_data_bits(9).is_err());
        assert!(config.with_flow_control("XONXOFF").is_err());
    }

    #[test]
    fn test_requires_a_port() {
        assert!(matches!(
            SerialStream::new(None, None, SerialConfig::default(), StreamConfig::default()),
            Err(StreamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_device_fails_to_connect() {
        let stream = SerialStream::new(
            Some("/dev/linkprims-does-not-exist".to_string()),
            Some("/dev/linkprims-does-not-exist".to_string()),
            SerialConfig::default(),
            StreamConfig::default(),
        )
        .unwrap();
        assert!(matches!(stream.connect(), Err(StreamError::Serial(_))));
        assert!(!stream.connected());
        assert!(matches!(stream.read(), Err(StreamError::NotConnected)));
    }
}
