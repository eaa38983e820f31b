use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use linkprims_packet::parser::convert_to_value;
use linkprims_packet::{DataType, Packet, PacketKind, Value};
use tracing::{debug, error};

use crate::args::Args;
use crate::error::{ProtocolError, Result};
use crate::protocol::{LinkInfo, Outcome, Protocol, ResponseWait};
use crate::terminated::TerminatedProtocol;

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RESPONSE_POLLING_PERIOD: Duration = Duration::from_millis(20);

/// Command/response settings layered over terminated framing.
#[derive(Debug, Clone)]
pub struct TemplateOptions {
    /// Lines read and dropped before the response lines.
    pub ignore_lines: usize,
    pub response_lines: usize,
    /// Data received this soon after connecting is dropped.
    pub initial_read_delay: Option<Duration>,
    /// `None` waits for a response forever.
    pub response_timeout: Option<Duration>,
    pub response_polling_period: Duration,
    pub raise_exceptions: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            ignore_lines: 0,
            response_lines: 1,
            initial_read_delay: None,
            response_timeout: Some(DEFAULT_RESPONSE_TIMEOUT),
            response_polling_period: DEFAULT_RESPONSE_POLLING_PERIOD,
            raise_exceptions: false,
        }
    }
}

impl TemplateOptions {
    pub fn with_ignore_lines(mut self, lines: usize) -> Self {
        self.ignore_lines = lines;
        self
    }

    pub fn with_response_lines(mut self, lines: usize) -> Self {
        self.response_lines = lines;
        self
    }

    pub fn with_initial_read_delay(mut self, delay: Option<Duration>) -> Self {
        self.initial_read_delay = delay.filter(|delay| !delay.is_zero());
        self
    }

    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn with_response_polling_period(mut self, period: Duration) -> Self {
        self.response_polling_period = period;
        self
    }

    pub fn with_raise_exceptions(mut self, raise: bool) -> Self {
        self.raise_exceptions = raise;
        self
    }
}

#[derive(Debug)]
struct ExpectedResponse {
    template: String,
    target_name: Option<String>,
    packet_name: String,
}

/// Text command/response protocol.
///
/// Commands carry a `CMD_TEMPLATE` string whose `<ITEM>` placeholders are
/// filled from the command's own items. When the command also has
/// `RSP_TEMPLATE` and `RSP_PACKET`, the write waits until the response lines
/// arrive; they are matched against the response template and the captured
/// values are written into a fresh telemetry packet named by `RSP_PACKET`.
#[derive(Debug)]
pub struct TemplateProtocol {
    terminated: TerminatedProtocol,
    options: TemplateOptions,
    link: LinkInfo,
    expected: Option<ExpectedResponse>,
    awaiting: bool,
    response_packets: Vec<Packet>,
    release: Sender<()>,
    released: Arc<Mutex<Receiver<()>>>,
    connect_complete: Option<Instant>,
    initial_read_delay_needed: bool,
}

impl TemplateProtocol {
    pub fn new(terminated: TerminatedProtocol, options: TemplateOptions) -> Self {
        let (release, released) = mpsc::channel();
        Self {
            terminated,
            options,
            link: LinkInfo::default(),
            expected: None,
            awaiting: false,
            response_packets: Vec::new(),
            release,
            released: Arc::new(Mutex::new(released)),
            connect_complete: None,
            initial_read_delay_needed: true,
        }
    }

    /// `write_termination_characters read_termination_characters
    /// ignore_lines initial_read_delay response_lines strip_read_termination
    /// discard_leading_bytes sync_pattern fill_fields response_timeout
    /// response_polling_period raise_exceptions allow_empty_data`
    pub fn from_args(values: &[String]) -> Result<Self> {
        let args = Args::new("TEMPLATE", values, 13)?;
        let terminated = TerminatedProtocol::new(
            args.hex(0, "write_termination_characters")?.unwrap_or_default(),
            args.hex(1, "read_termination_characters")?.unwrap_or_default(),
            args.flag(5, "strip_read_termination", true)?,
            args.size(6, "discard_leading_bytes", 0)?,
            args.hex(7, "sync_pattern")?,
            args.flag(8, "fill_fields", false)?,
            args.opt_flag(12, "allow_empty_data")?,
        )?;
        let response_timeout = if args.given(9) {
            args.seconds(9, "response_timeout")?
        } else {
            Some(DEFAULT_RESPONSE_TIMEOUT)
        };
        let response_polling_period = if args.given(10) {
            args.seconds(10, "response_polling_period")?.unwrap_or_default()
        } else {
            DEFAULT_RESPONSE_POLLING_PERIOD
        };
        let options = TemplateOptions::default()
            .with_ignore_lines(args.size(2, "ignore_lines", 0)?)
            .with_initial_read_delay(args.seconds(3, "initial_read_delay")?)
            .with_response_lines(args.size(4, "response_lines", 1)?)
            .with_response_timeout(response_timeout)
            .with_response_polling_period(response_polling_period)
            .with_raise_exceptions(args.flag(11, "raise_exceptions", false)?);
        Ok(Self::new(terminated, options))
    }

    pub fn options(&self) -> &TemplateOptions {
        &self.options
    }

    fn delaying_reads(&self) -> bool {
        self.options.initial_read_delay.is_some() && self.initial_read_delay_needed
    }

    fn drain_releases(&self) {
        let released = self.released.lock().unwrap_or_else(|e| e.into_inner());
        while released.try_recv().is_ok() {}
    }

    fn handle_error(&self, message: String) -> Result<()> {
        error!(interface = %self.link.name, "{message}");
        if self.options.raise_exceptions {
            return Err(ProtocolError::Response(message));
        }
        Ok(())
    }

    /// Build the telemetry packet a response maps onto.
    fn response_packet(&self, expected: &ExpectedResponse, response: &str) -> Result<Packet> {
        let system = self.link.system.as_ref().ok_or_else(|| {
            ProtocolError::Response(format!(
                "{}: no packet definitions for response {}",
                self.link.name, expected.packet_name
            ))
        })?;
        let target_name = expected.target_name.as_deref().unwrap_or("UNKNOWN");
        let def = system.packet(PacketKind::Telemetry, target_name, &expected.packet_name)?;
        let mut result = Packet::from_def(Arc::clone(&def));
        result.restore_defaults()?;
        for item in def.id_items() {
            if let Some(id_value) = &item.id_value {
                result.write(&item.name, id_value)?;
            }
        }

        let Some(values) = match_template(&expected.template, response)
            .filter(|values| values.iter().all(|(_, value)| !value.is_empty()))
        else {
            self.handle_error(format!("{}: Unexpected response: {response}", self.link.name))?;
            return Ok(result);
        };
        for (name, text) in values {
            let written = def
                .get_item(name)
                .map(|item| typed_value(item.data_type, text))
                .and_then(|value| result.write(name, &value));
            if let Err(err) = written {
                self.handle_error(format!(
                    "{}: Could not write value {text} due to {err}",
                    self.link.name
                ))?;
                break;
            }
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// Split a template into literal text and `<NAME>` placeholders.
fn parts(template: &str) -> Vec<Part<'_>> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start + 1..].find('>') else {
            break;
        };
        if start > 0 {
            parts.push(Part::Literal(&rest[..start]));
        }
        parts.push(Part::Placeholder(&rest[start + 1..start + 1 + len]));
        rest = &rest[start + len + 2..];
    }
    if !rest.is_empty() {
        parts.push(Part::Literal(rest));
    }
    parts
}

fn placeholders(template: &str) -> Vec<&str> {
    parts(template)
        .into_iter()
        .filter_map(|part| match part {
            Part::Placeholder(name) => Some(name),
            Part::Literal(_) => None,
        })
        .collect()
}

/// Find the first place `text` matches `template` and return each
/// placeholder with the text it captured. Placeholders are greedy.
fn match_template<'a, 't>(template: &'a str, text: &'t str) -> Option<Vec<(&'a str, &'t str)>> {
    let parts = parts(template);
    (0..=text.len())
        .filter(|&start| text.is_char_boundary(start))
        .find_map(|start| {
            let mut captures = Vec::new();
            match_parts(&parts, text, start, &mut captures).then_some(captures)
        })
}

fn match_parts<'a, 't>(
    parts: &[Part<'a>],
    text: &'t str,
    pos: usize,
    captures: &mut Vec<(&'a str, &'t str)>,
) -> bool {
    match parts.split_first() {
        None => true,
        Some((&Part::Literal(literal), rest)) => {
            text[pos..].starts_with(literal)
                && match_parts(rest, text, pos + literal.len(), captures)
        }
        Some((&Part::Placeholder(name), rest)) => {
            let ends: Vec<usize> = text[pos..]
                .char_indices()
                .map(|(offset, _)| pos + offset)
                .chain(std::iter::once(text.len()))
                .collect();
            for &end in ends.iter().rev() {
                captures.push((name, &text[pos..end]));
                if match_parts(rest, text, end, captures) {
                    return true;
                }
                captures.pop();
            }
            false
        }
    }
}

fn typed_value(data_type: DataType, text: &str) -> Value {
    match data_type {
        DataType::Int | DataType::Uint | DataType::Float => convert_to_value(text.trim()),
        DataType::Block => Value::Block(text.as_bytes().to_vec()),
        DataType::String | DataType::Derived => Value::String(text.to_string()),
    }
}

fn read_text(packet: &Packet, name: &str) -> Option<String> {
    let value = packet.read(name).ok().flatten()?;
    let text = value.to_string().trim().to_string();
    (!text.is_empty()).then_some(text)
}

impl Protocol for TemplateProtocol {
    fn name(&self) -> &'static str {
        "TEMPLATE"
    }

    fn attach(&mut self, link: &LinkInfo) {
        self.terminated.attach(link);
        self.link = link.clone();
    }

    fn allow_empty_data(&self) -> Option<bool> {
        self.terminated.allow_empty_data()
    }

    fn read_data(&mut self, data: BytesMut, at_tail: bool) -> Result<Outcome<BytesMut>> {
        if !data.is_empty() && self.delaying_reads() {
            if let Some(complete) = self.connect_complete {
                if Instant::now() < complete {
                    debug!(interface = %self.link.name, len = data.len(), "dropping data during initial read delay");
                    return Ok(Outcome::Stop);
                }
                self.initial_read_delay_needed = false;
            }
        }
        self.terminated.read_data(data, at_tail)
    }

    fn read_packet(&mut self, packet: Packet) -> Result<Outcome<Packet>> {
        let Some(expected) = self.expected.take() else {
            return Ok(Outcome::Ready(packet));
        };
        self.response_packets.push(packet);
        if self.response_packets.len() < self.options.ignore_lines + self.options.response_lines {
            self.expected = Some(expected);
            return Ok(Outcome::Stop);
        }

        let response: Vec<u8> = self
            .response_packets
            .drain(..)
            .skip(self.options.ignore_lines)
            .take(self.options.response_lines)
            .flat_map(|packet| packet.buffer)
            .collect();
        let response = String::from_utf8_lossy(&response);
        let result = self.response_packet(&expected, &response);
        let _ = self.release.send(());
        result.map(Outcome::Ready)
    }

    fn write_packet(&mut self, packet: Packet) -> Result<Outcome<Packet>> {
        if self.delaying_reads() {
            if let Some(complete) = self.connect_complete {
                let now = Instant::now();
                if complete > now {
                    std::thread::sleep(complete - now);
                }
            }
        }

        self.response_packets.clear();
        self.drain_releases();
        self.expected = match (read_text(&packet, "RSP_TEMPLATE"), read_text(&packet, "RSP_PACKET")) {
            (Some(template), Some(packet_name)) => Some(ExpectedResponse {
                template,
                target_name: packet.target_name.clone(),
                packet_name,
            }),
            _ => None,
        };

        let template = packet
            .read("CMD_TEMPLATE")?
            .map(|value| value.to_string())
            .ok_or_else(|| ProtocolError::Write("CMD_TEMPLATE is empty".to_string()))?;
        let mut command = template.clone();
        for name in placeholders(&template) {
            let value = packet.read(name)?.map(|value| value.to_string()).unwrap_or_default();
            let placeholder = format!("<{name}>");
            command = command.replace(&placeholder, &value);
            if let Some(expected) = &mut self.expected {
                expected.packet_name = expected.packet_name.replace(&placeholder, &value);
            }
        }
        self.awaiting = self.expected.is_some();
        self.terminated.write_packet(Packet::raw(command.into_bytes()))
    }

    fn write_data(&mut self, data: Vec<u8>) -> Result<Outcome<Vec<u8>>> {
        self.terminated.write_data(data)
    }

    fn response_wait(&mut self) -> Option<ResponseWait> {
        if !std::mem::take(&mut self.awaiting) {
            return None;
        }
        Some(ResponseWait::new(
            Arc::clone(&self.released),
            self.options.response_timeout,
            self.options.response_polling_period,
            self.link.name.clone(),
            self.options.raise_exceptions,
        ))
    }

    fn post_write_interface(&mut self, _packet: &Packet, _data: &[u8]) -> Result<()> {
        self.expected = None;
        self.awaiting = false;
        self.response_packets.clear();
        Ok(())
    }

    fn reset(&mut self) {
        self.terminated.reset();
        self.initial_read_delay_needed = true;
    }

    fn connect_reset(&mut self) {
        self.reset();
        self.drain_releases();
        self.expected = None;
        self.awaiting = false;
        self.response_packets.clear();
        self.connect_complete = self
            .options
            .initial_read_delay
            .map(|delay| Instant::now() + delay);
    }

    fn disconnect_reset(&mut self) {
        self.reset();
        self.expected = None;
        let _ = self.release.send(());
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use linkprims_packet::System;

    use super::*;

    const INST_CMD_TLM: &str = r#"
COMMAND INST SET_VOLTAGE BIG_ENDIAN
  APPEND_PARAMETER CHANNEL 8 UINT 0 3 1
  APPEND_PARAMETER VOLTAGE 32 FLOAT 0.0 30.0 2.5
  APPEND_PARAMETER CMD_TEMPLATE 512 STRING "SOUR:VOLT <VOLTAGE>, (@<CHANNEL>)"
  APPEND_PARAMETER RSP_TEMPLATE 256 STRING "VOLT <VOLTAGE>"
  APPEND_PARAMETER RSP_PACKET 128 STRING "READ_<CHANNEL>"
COMMAND INST RESET BIG_ENDIAN
  APPEND_PARAMETER CMD_TEMPLATE 64 STRING "*RST"
TELEMETRY INST READ_1 BIG_ENDIAN
  APPEND_ID_ITEM ID 8 UINT 1
  APPEND_ITEM VOLTAGE 32 FLOAT
"#;

    fn make_temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "linkprims-template-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn system(dir: &Path) -> Arc<System> {
        let path = dir.join("INST/cmd_tlm/cmd_tlm.txt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, INST_CMD_TLM).unwrap();
        Arc::new(System::new(&["INST"], dir).unwrap())
    }

    fn attached(system: Arc<System>, options: TemplateOptions) -> TemplateProtocol {
        let terminated =
            TerminatedProtocol::new(b"\n".to_vec(), b"\n".to_vec(), true, 0, None, false, None)
                .unwrap();
        let mut protocol = TemplateProtocol::new(terminated, options);
        protocol.attach(&LinkInfo {
            name: "PSU_INT".to_string(),
            cmd_target_names: vec!["INST".to_string()],
            tlm_target_names: vec!["INST".to_string()],
            system: Some(system),
        });
        protocol
    }

    fn command(system: &System, name: &str) -> Packet {
        let def = system.packet(PacketKind::Command, "INST", name).unwrap();
        let mut packet = Packet::from_def(def);
        packet.restore_defaults().unwrap();
        packet
    }

    fn written(outcome: Outcome<Packet>) -> Vec<u8> {
        let Outcome::Ready(packet) = outcome else {
            panic!("expected a packet");
        };
        packet.buffer
    }

    #[test]
    fn test_match_template_is_greedy_and_unanchored() {
        assert_eq!(
            match_template("<A> <B>", "1 2 3"),
            Some(vec![("A", "1 2"), ("B", "3")])
        );
        assert_eq!(
            match_template("VOLT <V>;", "> VOLT 4.5;"),
            Some(vec![("V", "4.5")])
        );
        assert_eq!(match_template("VOLT <V>", "CURR 1.0"), None);
        assert_eq!(placeholders("A<X>B<Y"), vec!["X"]);
    }

    #[test]
    fn test_command_without_response_is_not_awaited() {
        let dir = make_temp_dir("no-response");
        let system = system(&dir);
        let mut protocol = attached(system.clone(), TemplateOptions::default());

        let raw = written(protocol.write_packet(command(&system, "RESET")).unwrap());
        assert_eq!(raw, b"*RST");
        assert_eq!(
            protocol.write_data(raw).unwrap(),
            Outcome::Ready(b"*RST\n".to_vec())
        );
        assert!(protocol.response_wait().is_none());

        // Unsolicited lines pass through untouched.
        let Outcome::Ready(packet) = protocol.read_packet(Packet::raw(b"hello".to_vec())).unwrap()
        else {
            panic!("expected a packet");
        };
        assert_eq!(packet.buffer, b"hello");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_response_fills_telemetry_packet() {
        let dir = make_temp_dir("response");
        let system = system(&dir);
        let mut protocol = attached(system.clone(), TemplateOptions::default().with_ignore_lines(1));

        let raw = written(protocol.write_packet(command(&system, "SET_VOLTAGE")).unwrap());
        assert_eq!(raw, b"SOUR:VOLT 2.5, (@1)");
        let wait = protocol.response_wait().expect("response expected");
        assert!(protocol.response_wait().is_none());

        assert_eq!(
            protocol.read_packet(Packet::raw(b"echo".to_vec())).unwrap(),
            Outcome::Stop
        );
        let Outcome::Ready(packet) = protocol.read_packet(Packet::raw(b"VOLT 3.25".to_vec())).unwrap()
        else {
            panic!("expected a packet");
        };
        assert_eq!(packet.packet_name.as_deref(), Some("READ_1"));
        assert_eq!(packet.read("ID").unwrap(), Some(Value::Int(1)));
        assert_eq!(packet.read("VOLTAGE").unwrap(), Some(Value::Float(3.25)));

        // The response already released the write.
        wait.wait().unwrap();
        protocol.post_write_interface(&packet, &[]).unwrap();
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_unexpected_response() {
        let dir = make_temp_dir("unexpected");
        let system = system(&dir);

        let mut lenient = attached(system.clone(), TemplateOptions::default());
        lenient.write_packet(command(&system, "SET_VOLTAGE")).unwrap();
        let Outcome::Ready(packet) = lenient.read_packet(Packet::raw(b"ERR 7".to_vec())).unwrap()
        else {
            panic!("expected a packet");
        };
        assert_eq!(packet.packet_name.as_deref(), Some("READ_1"));
        assert_eq!(packet.read("VOLTAGE").unwrap(), Some(Value::Float(0.0)));

        let mut strict = attached(system.clone(), TemplateOptions::default().with_raise_exceptions(true));
        strict.write_packet(command(&system, "SET_VOLTAGE")).unwrap();
        let wait = strict.response_wait().expect("response expected");
        let err = strict.read_packet(Packet::raw(b"ERR 7".to_vec())).unwrap_err();
        assert_eq!(err.to_string(), "PSU_INT: Unexpected response: ERR 7");
        // Released even though the response was rejected.
        wait.wait().unwrap();
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_response_timeout() {
        let dir = make_temp_dir("timeout");
        let system = system(&dir);
        let options = TemplateOptions::default()
            .with_response_timeout(Some(Duration::from_millis(20)))
            .with_response_polling_period(Duration::from_millis(5))
            .with_raise_exceptions(true);
        let mut protocol = attached(system.clone(), options);

        protocol.write_packet(command(&system, "SET_VOLTAGE")).unwrap();
        let err = protocol.response_wait().unwrap().wait().unwrap_err();
        assert_eq!(err.to_string(), "PSU_INT: Timeout waiting for response");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_disconnect_releases_waiting_write() {
        let dir = make_temp_dir("disconnect");
        let system = system(&dir);
        let mut protocol = attached(system.clone(), TemplateOptions::default().with_response_timeout(None));

        protocol.write_packet(command(&system, "SET_VOLTAGE")).unwrap();
        let wait = protocol.response_wait().unwrap();
        protocol.disconnect_reset();
        wait.wait().unwrap();

        // A stale release does not leak into the next connection.
        protocol.connect_reset();
        protocol.write_packet(command(&system, "SET_VOLTAGE")).unwrap();
        assert!(protocol.released.lock().unwrap().try_recv().is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_initial_read_delay_drops_data() {
        let dir = make_temp_dir("delay");
        let options =
            TemplateOptions::default().with_initial_read_delay(Some(Duration::from_millis(40)));
        let mut protocol = attached(system(&dir), options);
        protocol.connect_reset();

        assert_eq!(
            protocol.read_data(BytesMut::from(&b"WELCOME\n"[..]), true).unwrap(),
            Outcome::Stop
        );
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            protocol.read_data(BytesMut::from(&b"OK\n"[..]), true).unwrap(),
            Outcome::Ready(BytesMut::from(&b"OK"[..]))
        );
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_from_args() {
        let args: Vec<String> = ["0x0A", "0x0A", "2", "0", "3", "FALSE", "0", "nil", "FALSE", "nil", "0.5"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let protocol = TemplateProtocol::from_args(&args).unwrap();
        assert_eq!(protocol.name(), "TEMPLATE");
        let options = protocol.options();
        assert_eq!(options.ignore_lines, 2);
        assert_eq!(options.response_lines, 3);
        assert!(options.initial_read_delay.is_none());
        assert!(options.response_timeout.is_none());
        assert_eq!(options.response_polling_period, Duration::from_millis(500));

        let args: Vec<String> = vec!["0x0A".into(), "0x0A".into()];
        let options = TemplateProtocol::from_args(&args).unwrap().options().clone();
        assert_eq!(options.response_timeout, Some(DEFAULT_RESPONSE_TIMEOUT));
        assert_eq!(options.response_polling_period, DEFAULT_RESPONSE_POLLING_PERIOD);

        let args: Vec<String> = vec!["0x0A".into(), "0x0A".into(), "0".into(), "soon".into()];
        assert!(TemplateProtocol::from_args(&args).is_err());
    }
}
