//! Interface implementations by name, built from config-line arguments.
//!
//! | Name | Arguments |
//! |---|---|
//! | `TCPIP_CLIENT` | `host write_port read_port write_timeout read_timeout` |
//! | `TCPIP_SERVER` | `write_port read_port write_timeout read_timeout` |
//! | `UDP` | `hostname write_dest_port read_port [write_src_port interface_address ttl write_timeout read_timeout bind_address]` |
//! | `SERIAL` | `write_port read_port baud_rate parity stop_bits write_timeout read_timeout` |
//! | `MQTT_STREAM` | `host port write_topic read_topic` |
//! | `WEBSOCKET` | `url write_timeout read_timeout` |
//!
//! Except for `UDP`, whose trailing arguments are optional, any further
//! arguments name a protocol and its arguments, added as `READ_WRITE`.
//! `nil`/`none` disables a port, topic or timeout.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use linkprims_packet::parser::handle_none;
use linkprims_stream::{
    MqttConfig, MqttStream, SerialConfig, SerialStream, Stream, StreamConfig, TcpClientStream,
    TcpServerStream, UdpConfig, UdpStream, WebSocketStream,
};
use tracing::warn;

use crate::error::{InterfaceError, Result};
use crate::interface::{Interface, InterfaceConfig, ProtocolKind};

const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
const DEFAULT_UDP_TTL: u32 = 128;
const DEFAULT_UDP_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Registered implementation names with their required and optional
/// argument counts. Only implementations without optional arguments take a
/// trailing protocol.
const IMPLEMENTATIONS: &[(&str, usize, usize)] = &[
    ("TCPIP_CLIENT", 5, 0),
    ("TCPIP_SERVER", 4, 0),
    ("UDP", 3, 6),
    ("SERIAL", 7, 0),
    ("MQTT_STREAM", 4, 0),
    ("WEBSOCKET", 3, 0),
];

/// Upper snake case of a class reference given as a file path
/// (`interfaces/burst_protocol.py`), a class name (`BurstProtocol`) or a
/// plain name (`BURST`).
pub fn class_name(raw: &str) -> String {
    let file = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let stem = file.split('.').next().unwrap_or(file);
    if stem.contains('_') || !stem.chars().any(|c| c.is_ascii_lowercase()) {
        return stem.to_ascii_uppercase();
    }
    let mut name = String::with_capacity(stem.len() + 4);
    for (index, c) in stem.chars().enumerate() {
        if index > 0 && c.is_ascii_uppercase() {
            name.push('_');
        }
        name.push(c.to_ascii_uppercase());
    }
    name
}

/// Reduce `openc3/interfaces/tcpip_client_interface.py`,
/// `TcpipClientInterface` or `TCPIP_CLIENT_INTERFACE` to `TCPIP_CLIENT`.
pub fn implementation_name(raw: &str) -> String {
    let upper = class_name(raw);
    upper
        .strip_suffix("_INTERFACE")
        .map(str::to_string)
        .unwrap_or(upper)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    IMPLEMENTATIONS.iter().map(|(name, _, _)| *name)
}

pub fn is_registered(raw: &str) -> bool {
    let name = implementation_name(raw);
    IMPLEMENTATIONS.iter().any(|(registered, _, _)| *registered == name)
}

/// Where a stream connects, with its timeouts.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSpec {
    TcpClient {
        host: String,
        write_port: Option<u16>,
        read_port: Option<u16>,
        write_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
    },
    TcpServer {
        write_port: Option<u16>,
        read_port: Option<u16>,
        write_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
    },
    Udp {
        hostname: Option<String>,
        write_dest_port: Option<u16>,
        read_port: Option<u16>,
        write_src_port: Option<u16>,
        interface_address: Option<Ipv4Addr>,
        ttl: u32,
        write_timeout: Duration,
        read_timeout: Option<Duration>,
        bind_address: String,
    },
    Serial {
        write_port: Option<String>,
        read_port: Option<String>,
        baud_rate: u32,
        parity: String,
        stop_bits: u8,
        write_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
    },
    Mqtt {
        host: String,
        port: u16,
        write_topic: Option<String>,
        read_topic: Option<String>,
    },
    WebSocket {
        url: String,
        write_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
    },
}

/// A parsed interface line: the link plus the optional trailing protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceSpec {
    pub link: LinkSpec,
    pub protocol: Option<(String, Vec<String>)>,
}

struct Params<'a> {
    implementation: &'static str,
    values: &'a [String],
}

impl Params<'_> {
    fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|value| handle_none(value))
    }

    fn string(&self, index: usize, what: &str) -> Result<String> {
        self.get(index)
            .map(str::to_string)
            .ok_or_else(|| InterfaceError::invalid(self.implementation, format!("{what} is required")))
    }

    fn port(&self, index: usize, what: &str) -> Result<Option<u16>> {
        self.get(index)
            .map(|value| {
                value.parse::<u16>().map_err(|_| {
                    InterfaceError::invalid(self.implementation, format!("invalid {what} {value}"))
                })
            })
            .transpose()
    }

    fn timeout(&self, index: usize, what: &str) -> Result<Option<Duration>> {
        self.get(index)
            .map(|value| parse_seconds(value).ok_or_else(|| {
                InterfaceError::invalid(self.implementation, format!("invalid {what} {value}"))
            }))
            .transpose()
    }

    fn address(&self, index: usize, what: &str) -> Result<Option<Ipv4Addr>> {
        self.get(index)
            .map(|value| {
                let value = if value.eq_ignore_ascii_case("LOCALHOST") {
                    "127.0.0.1"
                } else {
                    value
                };
                value.parse::<Ipv4Addr>().map_err(|_| {
                    InterfaceError::invalid(self.implementation, format!("invalid {what} {value}"))
                })
            })
            .transpose()
    }

    fn number<T: std::str::FromStr>(&self, index: usize, what: &str) -> Result<T> {
        let value = self.string(index, what)?;
        value
            .parse()
            .map_err(|_| InterfaceError::invalid(self.implementation, format!("invalid {what} {value}")))
    }
}

/// Seconds as a decimal number, e.g. `10.0`.
pub(crate) fn parse_seconds(value: &str) -> Option<Duration> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
}

/// Parse and validate an interface line's arguments. The trailing protocol,
/// if any, is checked against the protocol registry.
pub fn parse(raw_name: &str, values: &[String]) -> Result<InterfaceSpec> {
    let name = implementation_name(raw_name);
    let (implementation, count, optional) = IMPLEMENTATIONS
        .iter()
        .find(|(registered, _, _)| *registered == name)
        .copied()
        .ok_or_else(|| InterfaceError::UnknownInterface(raw_name.to_string()))?;
    if values.len() < count {
        return Err(InterfaceError::invalid(
            implementation,
            format!("expected at least {count} arguments, got {}", values.len()),
        ));
    }
    if optional > 0 && values.len() > count + optional {
        return Err(InterfaceError::invalid(
            implementation,
            format!("expected at most {} arguments, got {}", count + optional, values.len()),
        ));
    }
    let params = Params {
        implementation,
        values,
    };

    let link = match implementation {
        "TCPIP_CLIENT" => LinkSpec::TcpClient {
            host: params.string(0, "host")?,
            write_port: params.port(1, "write_port")?,
            read_port: params.port(2, "read_port")?,
            write_timeout: params.timeout(3, "write_timeout")?,
            read_timeout: params.timeout(4, "read_timeout")?,
        },
        "TCPIP_SERVER" => LinkSpec::TcpServer {
            write_port: params.port(0, "write_port")?,
            read_port: params.port(1, "read_port")?,
            write_timeout: params.timeout(2, "write_timeout")?,
            read_timeout: params.timeout(3, "read_timeout")?,
        },
        "UDP" => LinkSpec::Udp {
            hostname: params.get(0).map(str::to_string),
            write_dest_port: params.port(1, "write_dest_port")?,
            read_port: params.port(2, "read_port")?,
            write_src_port: params.port(3, "write_src_port")?,
            interface_address: params.address(4, "interface_address")?,
            ttl: match params.get(5) {
                Some(_) => params.number::<i64>(5, "ttl")?.clamp(1, i64::from(u32::MAX)) as u32,
                None => DEFAULT_UDP_TTL,
            },
            write_timeout: match params.timeout(6, "write_timeout")? {
                Some(timeout) => timeout,
                None => {
                    if values.len() > 6 {
                        warn!("UDP write_timeout can not be nil, using 10 seconds");
                    }
                    DEFAULT_UDP_WRITE_TIMEOUT
                }
            },
            read_timeout: params.timeout(7, "read_timeout")?,
            bind_address: params.get(8).unwrap_or(DEFAULT_LISTEN_ADDRESS).to_string(),
        },
        "SERIAL" => LinkSpec::Serial {
            write_port: params.get(0).map(str::to_string),
            read_port: params.get(1).map(str::to_string),
            baud_rate: params.number(2, "baud_rate")?,
            parity: params.string(3, "parity")?,
            stop_bits: params.number(4, "stop_bits")?,
            write_timeout: params.timeout(5, "write_timeout")?,
            read_timeout: params.timeout(6, "read_timeout")?,
        },
        "MQTT_STREAM" => LinkSpec::Mqtt {
            host: params.string(0, "host")?,
            port: params.number(1, "port")?,
            write_topic: params.get(2).map(str::to_string),
            read_topic: params.get(3).map(str::to_string),
        },
        _ => LinkSpec::WebSocket {
            url: params.string(0, "url")?,
            write_timeout: params.timeout(1, "write_timeout")?,
            read_timeout: params.timeout(2, "read_timeout")?,
        },
    };

    let protocol = match params.get(count).filter(|_| optional == 0) {
        Some(protocol) => {
            let protocol = class_name(protocol);
            let args = values[count + 1..].to_vec();
            linkprims_protocol::registry::create(&protocol, &args)?;
            Some((protocol, args))
        }
        None => None,
    };

    // Catch bad settings now rather than at connect time.
    link.build_stream(&BTreeMap::new())?;
    Ok(InterfaceSpec { link, protocol })
}

fn option<'a>(options: &'a BTreeMap<String, Vec<String>>, name: &str) -> Option<&'a str> {
    options
        .get(name)
        .and_then(|values| values.first())
        .map(String::as_str)
}

impl LinkSpec {
    /// Create the stream, applying interface options:
    /// - `LISTEN_ADDRESS` for TCP servers
    /// - `FLOW_CONTROL`, `DATA_BITS` for serial ports
    /// - `USERNAME`, `PASSWORD`, `ACK_TIMEOUT`, `CLIENT_ID` for MQTT
    pub fn build_stream(&self, options: &BTreeMap<String, Vec<String>>) -> Result<Box<dyn Stream>> {
        let stream: Box<dyn Stream> = match self {
            Self::TcpClient {
                host,
                write_port,
                read_port,
                write_timeout,
                read_timeout,
            } => Box::new(TcpClientStream::new(
                host.clone(),
                *write_port,
                *read_port,
                stream_config(*write_timeout, *read_timeout),
            )?),
            Self::TcpServer {
                write_port,
                read_port,
                write_timeout,
                read_timeout,
            } => Box::new(TcpServerStream::new(
                option(options, "LISTEN_ADDRESS").unwrap_or(DEFAULT_LISTEN_ADDRESS),
                *write_port,
                *read_port,
                stream_config(*write_timeout, *read_timeout),
            )?),
            Self::Udp {
                hostname,
                write_dest_port,
                read_port,
                write_src_port,
                interface_address,
                ttl,
                write_timeout,
                read_timeout,
                bind_address,
            } => Box::new(UdpStream::new(
                UdpConfig::new(hostname.as_deref().unwrap_or_default())
                    .with_write_dest_port(*write_dest_port)
                    .with_read_port(*read_port)
                    .with_write_src_port(*write_src_port)
                    .with_interface_address(*interface_address)
                    .with_ttl(*ttl)
                    .with_bind_address(bind_address),
                stream_config(Some(*write_timeout), *read_timeout),
            )?),
            Self::Serial {
                write_port,
                read_port,
                baud_rate,
                parity,
                stop_bits,
                write_timeout,
                read_timeout,
            } => {
                let mut serial = SerialConfig::new(*baud_rate)
                    .with_parity(parity)?
                    .with_stop_bits(*stop_bits)?;
                if let Some(flow_control) = option(options, "FLOW_CONTROL") {
                    serial = serial.with_flow_control(flow_control)?;
                }
                if let Some(data_bits) = option(options, "DATA_BITS") {
                    let data_bits = data_bits.parse::<u8>().map_err(|_| {
                        InterfaceError::invalid("SERIAL", format!("invalid DATA_BITS {data_bits}"))
                    })?;
                    serial = serial.with_data_bits(data_bits)?;
                }
                Box::new(SerialStream::new(
                    write_port.clone(),
                    read_port.clone(),
                    serial,
                    stream_config(*write_timeout, *read_timeout),
                )?)
            }
            Self::Mqtt {
                host,
                port,
                write_topic,
                read_topic,
            } => {
                let mut mqtt = MqttConfig {
                    client_id: option(options, "CLIENT_ID").map(str::to_string),
                    username: option(options, "USERNAME").map(str::to_string),
                    password: option(options, "PASSWORD").map(str::to_string),
                    ..MqttConfig::default()
                };
                if let Some(ack_timeout) = option(options, "ACK_TIMEOUT") {
                    mqtt.ack_timeout = parse_seconds(ack_timeout).ok_or_else(|| {
                        InterfaceError::invalid("MQTT_STREAM", format!("invalid ACK_TIMEOUT {ack_timeout}"))
                    })?;
                }
                Box::new(MqttStream::new(
                    host.clone(),
                    *port,
                    write_topic.clone(),
                    read_topic.clone(),
                    mqtt,
                    StreamConfig::default(),
                )?)
            }
            Self::WebSocket {
                url,
                write_timeout,
                read_timeout,
            } => Box::new(WebSocketStream::new(
                url.clone(),
                stream_config(*write_timeout, *read_timeout),
            )?),
        };
        Ok(stream)
    }
}

impl LinkSpec {
    /// Narrow what an interface may do to the directions the link has.
    fn restrict(&self, mut config: InterfaceConfig) -> InterfaceConfig {
        if let Self::Udp {
            write_dest_port,
            read_port,
            ..
        } = self
        {
            config.read_allowed &= read_port.is_some();
            config.write_allowed &= write_dest_port.is_some();
            config.write_raw_allowed &= write_dest_port.is_some();
        }
        config
    }
}

fn stream_config(write_timeout: Option<Duration>, read_timeout: Option<Duration>) -> StreamConfig {
    StreamConfig::default()
        .with_write_timeout(write_timeout)
        .with_read_timeout(read_timeout)
}

/// Build an interface from its spec: stream (with `options` applied),
/// options recorded, trailing protocol added as `READ_WRITE`.
pub fn build(
    name: &str,
    spec: &InterfaceSpec,
    options: &BTreeMap<String, Vec<String>>,
    config: InterfaceConfig,
) -> Result<Interface> {
    let stream = spec.link.build_stream(options)?;
    let mut interface = Interface::new(name, stream, spec.link.restrict(config));
    for (option, values) in options {
        interface.set_option(option, values.clone());
    }
    if let Some((protocol, args)) = &spec.protocol {
        let protocol = linkprims_protocol::registry::create(protocol, args)?;
        interface.add_protocol(ProtocolKind::ReadWrite, protocol);
    }
    Ok(interface)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_implementation_names() {
        assert_eq!(
            implementation_name("openc3/interfaces/tcpip_client_interface.py"),
            "TCPIP_CLIENT"
        );
        assert_eq!(implementation_name("SERIAL_INTERFACE"), "SERIAL");
        assert_eq!(implementation_name("websocket"), "WEBSOCKET");
        assert_eq!(implementation_name("TcpipServerInterface"), "TCPIP_SERVER");
        assert_eq!(class_name("protocols/burst_protocol.py"), "BURST_PROTOCOL");
        assert_eq!(class_name("LengthProtocol"), "LENGTH_PROTOCOL");
        assert!(is_registered("mqtt_stream_interface.rb"));
        assert!(is_registered("udp_interface.py"));
        assert!(!is_registered("spi_interface.py"));
        assert_eq!(names().count(), 6);
    }

    #[test]
    fn test_parse_tcp_client_with_protocol() {
        let spec = parse(
            "TCPIP_CLIENT_INTERFACE",
            &strings(&["localhost", "8080", "8081", "10.0", "nil", "LENGTH", "0", "16"]),
        )
        .unwrap();
        assert_eq!(
            spec.link,
            LinkSpec::TcpClient {
                host: "localhost".to_string(),
                write_port: Some(8080),
                read_port: Some(8081),
                write_timeout: Some(Duration::from_secs(10)),
                read_timeout: None,
            }
        );
        assert_eq!(
            spec.protocol,
            Some(("LENGTH".to_string(), strings(&["0", "16"])))
        );
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert!(matches!(
            parse("SPI", &[]),
            Err(InterfaceError::UnknownInterface(_))
        ));
        assert!(parse("TCPIP_SERVER", &strings(&["2950"])).is_err());
        assert!(parse("TCPIP_SERVER", &strings(&["99999", "2950", "10", "nil"])).is_err());
        assert!(parse("TCPIP_SERVER", &strings(&["nil", "nil", "10", "nil"])).is_err());
        assert!(parse("TCPIP_SERVER", &strings(&["2950", "2950", "-1", "nil"])).is_err());
        assert!(matches!(
            parse("TCPIP_SERVER", &strings(&["2950", "2950", "10", "nil", "COBS"])),
            Err(InterfaceError::Protocol(_))
        ));
        assert!(parse(
            "SERIAL",
            &strings(&["/dev/ttyS0", "/dev/ttyS0", "9600", "MARK", "1", "10", "nil"])
        )
        .is_err());
        assert!(parse("WEBSOCKET", &strings(&["wss://example.com", "10", "nil"])).is_err());
    }

    #[test]
    fn test_parse_udp_optional_arguments() {
        let spec = parse("UdpInterface", &strings(&["LOCALHOST", "8080", "8081"])).unwrap();
        assert_eq!(
            spec.link,
            LinkSpec::Udp {
                hostname: Some("LOCALHOST".to_string()),
                write_dest_port: Some(8080),
                read_port: Some(8081),
                write_src_port: None,
                interface_address: None,
                ttl: 128,
                write_timeout: Duration::from_secs(10),
                read_timeout: None,
                bind_address: "0.0.0.0".to_string(),
            }
        );
        assert_eq!(spec.protocol, None);

        let spec = parse(
            "UDP_INTERFACE",
            &strings(&["224.0.0.5", "nil", "8081", "nil", "localhost", "0", "2.5", "1.0", "127.0.0.1"]),
        )
        .unwrap();
        let LinkSpec::Udp {
            interface_address,
            ttl,
            write_timeout,
            read_timeout,
            bind_address,
            ..
        } = &spec.link
        else {
            panic!("expected a udp link");
        };
        assert_eq!(*interface_address, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(*ttl, 1);
        assert_eq!(*write_timeout, Duration::from_millis(2500));
        assert_eq!(*read_timeout, Some(Duration::from_secs(1)));
        assert_eq!(bind_address, "127.0.0.1");

        assert!(parse("UDP", &strings(&["host", "nil", "nil"])).is_err());
        assert!(parse("UDP", &strings(&["host", "1", "2", "3", "4.4.4.4", "1", "1", "1", "0.0.0.0", "BURST"])).is_err());
        assert!(parse("UDP", &strings(&["host", "1", "2", "3", "not-an-ip"])).is_err());
    }

    #[test]
    fn test_udp_directions_limit_interface() {
        let spec = parse("UDP", &strings(&["127.0.0.1", "nil", "0"])).unwrap();
        let interface = build("TLM_INT", &spec, &BTreeMap::new(), InterfaceConfig::default()).unwrap();
        assert!(interface.config().read_allowed);
        assert!(!interface.config().write_allowed);
        assert!(!interface.config().write_raw_allowed);
        assert_eq!(interface.status().stream, "udp");
    }

    #[test]
    fn test_build_applies_options() {
        let spec = parse(
            "SERIAL",
            &strings(&["/dev/ttyS0", "nil", "115200", "NONE", "1", "10.0", "nil", "BURST"]),
        )
        .unwrap();
        let mut options = BTreeMap::new();
        options.insert("DATA_BITS".to_string(), strings(&["7"]));
        let interface = build("SERIAL_INT", &spec, &options, InterfaceConfig::default()).unwrap();
        assert_eq!(interface.option("data_bits"), Some(&strings(&["7"])[..]));
        assert_eq!(interface.protocol_info()[0].name, "BURST");
        assert_eq!(interface.status().stream, "serial");

        options.insert("DATA_BITS".to_string(), strings(&["9"]));
        assert!(build("SERIAL_INT", &spec, &options, InterfaceConfig::default()).is_err());
    }
}
