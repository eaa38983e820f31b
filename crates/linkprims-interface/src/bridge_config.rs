use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use linkprims_packet::{ConfigError, ConfigLine, ConfigParser};
use tracing::info;

use crate::error::Result;
use crate::interface::ProtocolKind;
use crate::registry::{self, InterfaceSpec};

const DEFAULT_CONFIG: &str = r#"# Write serial port name
VARIABLE write_port_name /dev/ttyUSB0

# Read serial port name
VARIABLE read_port_name /dev/ttyUSB0

# Baud Rate
VARIABLE baud_rate 115200

# Parity - NONE, ODD, or EVEN
VARIABLE parity NONE

# Stop bits - 1 or 2
VARIABLE stop_bits 1

# Write Timeout
VARIABLE write_timeout 10.0

# Read Timeout
VARIABLE read_timeout nil

# Flow Control - NONE, or RTS_CTS
VARIABLE flow_control NONE

# Data bits per word - Typically 8
VARIABLE data_bits 8

# Port to listen for connections from ground software
VARIABLE router_port 2950

# Address to listen on. Defaults to localhost; open it up if the ground
# software runs on another machine.
VARIABLE router_listen_address 127.0.0.1

INTERFACE SERIAL_INT SERIAL_INTERFACE <%= write_port_name %> <%= read_port_name %> <%= baud_rate %> <%= parity %> <%= stop_bits %> <%= write_timeout %> <%= read_timeout %>
  OPTION FLOW_CONTROL <%= flow_control %>
  OPTION DATA_BITS <%= data_bits %>

ROUTER SERIAL_ROUTER TCPIP_SERVER_INTERFACE <%= router_port %> <%= router_port %> 10.0 nil BURST
  ROUTE SERIAL_INT
  OPTION LISTEN_ADDRESS <%= router_listen_address %>
"#;

/// A protocol line attached to an interface or router.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolDecl {
    pub kind: ProtocolKind,
    pub name: String,
    pub args: Vec<String>,
}

/// A declared interface or router, validated but not yet built.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkDecl {
    pub name: String,
    pub spec: InterfaceSpec,
    pub options: BTreeMap<String, Vec<String>>,
    pub protocols: Vec<ProtocolDecl>,
    pub reconnect_delay: Option<Duration>,
    /// `LOG_STREAM`/`LOG_RAW` parameters; recorded only.
    pub log_stream: Option<Vec<String>>,
    /// Interfaces named by `ROUTE` (routers only).
    pub routes: Vec<String>,
    /// The line that declared this link, for locating build errors.
    pub line: ConfigLine,
}

impl LinkDecl {
    fn new(name: String, spec: InterfaceSpec, line: ConfigLine) -> Self {
        Self {
            name,
            spec,
            options: BTreeMap::new(),
            protocols: Vec::new(),
            reconnect_delay: None,
            log_stream: None,
            routes: Vec::new(),
            line,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Current {
    None,
    Interface(usize),
    Router(usize),
}

/// Declarative bridge wiring: interfaces, routers and the routes between
/// them.
///
/// Parsing runs twice over the file. The first pass collects `VARIABLE name
/// default` lines (caller-supplied values win); the second substitutes
/// `<%= name %>` and processes every other keyword. All names are upper
/// cased. Implementations, arguments and protocols are validated while
/// parsing; streams are created later by [`crate::Bridge::new`].
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    variables: HashMap<String, String>,
    interfaces: Vec<LinkDecl>,
    routers: Vec<LinkDecl>,
}

impl BridgeConfig {
    pub fn from_file(path: &Path, overrides: &HashMap<String, String>) -> Result<Self> {
        info!(path = %path.display(), "Processing Bridge configuration");
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError {
            message: format!("Configuration file {} could not be read: {err}", path.display()),
            filename: path.display().to_string(),
            line_number: 0,
            line: String::new(),
            usage: String::new(),
        })?;
        Self::parse(&text, &path.display().to_string(), overrides)
    }

    pub fn parse(text: &str, filename: &str, overrides: &HashMap<String, String>) -> Result<Self> {
        let variables = collect_variables(text, filename, overrides)?;
        let lines = ConfigParser::with_variables(variables.clone()).parse_str(text, filename)?;

        let mut config = Self {
            variables,
            ..Self::default()
        };
        let mut current = Current::None;
        for line in &lines {
            config.process_line(line, &mut current)?;
        }
        Ok(config)
    }

    /// Write a commented sample configuration: a serial interface exposed to
    /// ground software through a TCP server router.
    pub fn generate_default(path: &Path) -> Result<()> {
        info!(path = %path.display(), "Writing default bridge configuration");
        std::fs::write(path, DEFAULT_CONFIG)?;
        Ok(())
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn interfaces(&self) -> &[LinkDecl] {
        &self.interfaces
    }

    pub fn routers(&self) -> &[LinkDecl] {
        &self.routers
    }

    pub fn interface(&self, name: &str) -> Option<&LinkDecl> {
        let name = name.to_ascii_uppercase();
        self.interfaces.iter().find(|decl| decl.name == name)
    }

    pub fn router(&self, name: &str) -> Option<&LinkDecl> {
        let name = name.to_ascii_uppercase();
        self.routers.iter().find(|decl| decl.name == name)
    }

    fn current<'a>(&'a mut self, current: Current, line: &ConfigLine) -> Result<&'a mut LinkDecl> {
        let decl = match current {
            Current::Interface(index) => self.interfaces.get_mut(index),
            Current::Router(index) => self.routers.get_mut(index),
            Current::None => None,
        };
        decl.ok_or_else(|| {
            line.error(format!("No current interface or router for {}", line.keyword), "")
                .into()
        })
    }

    fn process_line(&mut self, line: &ConfigLine, current: &mut Current) -> Result<()> {
        match line.keyword.as_str() {
            // Handled in the first pass.
            "VARIABLE" => {}
            "INTERFACE" | "ROUTER" => {
                let is_router = line.keyword == "ROUTER";
                let usage = format!("{} <Name> <Implementation> <Specific Parameters>", line.keyword);
                line.verify_num_parameters(2, None, &usage)?;
                let name = line.params[0].to_ascii_uppercase();
                let (existing, kind) = if is_router {
                    (&self.routers, "Router")
                } else {
                    (&self.interfaces, "Interface")
                };
                if existing.iter().any(|decl| decl.name == name) {
                    return Err(line.error(format!("{kind} '{name}' defined twice"), usage).into());
                }
                let spec = registry::parse(&line.params[1], &line.params[2..])
                    .map_err(|err| line.error(err.to_string(), usage.as_str()))?;
                let decl = LinkDecl::new(name, spec, line.clone());
                if is_router {
                    self.routers.push(decl);
                    *current = Current::Router(self.routers.len() - 1);
                } else {
                    self.interfaces.push(decl);
                    *current = Current::Interface(self.interfaces.len() - 1);
                }
            }
            "ROUTE" => {
                let Current::Router(index) = *current else {
                    return Err(line.error("No current router for ROUTE", "").into());
                };
                let usage = "ROUTE <Interface Name>";
                line.verify_num_parameters(1, Some(1), usage)?;
                let interface = line.params[0].to_ascii_uppercase();
                if !self.interfaces.iter().any(|decl| decl.name == interface) {
                    let router = &self.routers[index].name;
                    return Err(line
                        .error(format!("Unknown interface {interface} mapped to router {router}"), usage)
                        .into());
                }
                let routes = &mut self.routers[index].routes;
                if !routes.contains(&interface) {
                    routes.push(interface);
                }
            }
            "RECONNECT_DELAY" => {
                let usage = "RECONNECT_DELAY <Delay in Seconds>";
                let decl = self.current(*current, line)?;
                line.verify_num_parameters(1, Some(1), usage)?;
                let delay = registry::parse_seconds(&line.params[0]).ok_or_else(|| {
                    line.error(format!("Invalid reconnect delay {}", line.params[0]), usage)
                })?;
                decl.reconnect_delay = Some(delay);
            }
            "LOG_STREAM" | "LOG_RAW" => {
                let decl = self.current(*current, line)?;
                decl.log_stream = Some(line.params.clone());
            }
            "OPTION" => {
                let usage = "OPTION <Option Name> <Option Value 1> <Option Value 2 (optional)> <etc>";
                let decl = self.current(*current, line)?;
                line.verify_num_parameters(2, None, usage)?;
                decl.options.insert(
                    line.params[0].to_ascii_uppercase(),
                    line.params[1..].to_vec(),
                );
            }
            "PROTOCOL" => {
                let usage =
                    "PROTOCOL <READ WRITE READ_WRITE> <Protocol name> <Protocol specific parameters>";
                let decl = self.current(*current, line)?;
                line.verify_num_parameters(2, None, usage)?;
                let kind: ProtocolKind = line.params[0].parse().map_err(|_| {
                    line.error(format!("Invalid protocol type: {}", line.params[0]), usage)
                })?;
                let name = registry::class_name(&line.params[1]);
                let args = line.params[2..].to_vec();
                linkprims_protocol::registry::create(&name, &args)
                    .map_err(|err| line.error(err.to_string(), usage))?;
                decl.protocols.push(ProtocolDecl { kind, name, args });
            }
            other => {
                return Err(line.error(format!("Unknown keyword: {other}"), "").into());
            }
        }
        Ok(())
    }
}

/// First pass: `VARIABLE` defaults, replaced by any caller override.
fn collect_variables(
    text: &str,
    filename: &str,
    overrides: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    // Blank out every other line so line numbers stay true and unresolved
    // substitutions elsewhere are not evaluated yet.
    let only_variables: Vec<&str> = text
        .lines()
        .map(|line| {
            let keyword = line.split_whitespace().next().unwrap_or("");
            if keyword.eq_ignore_ascii_case("VARIABLE") {
                line
            } else {
                ""
            }
        })
        .collect();

    let mut variables = HashMap::new();
    for line in ConfigParser::new().parse_str(&only_variables.join("\n"), filename)? {
        line.verify_num_parameters(2, None, "VARIABLE <Variable Name> <Default Value>")?;
        let name = line.params[0].clone();
        let value = overrides
            .get(&name)
            .cloned()
            .unwrap_or_else(|| line.params[1..].join(" "));
        variables.insert(name, value);
    }
    Ok(variables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterfaceError;

    fn parse(text: &str) -> Result<BridgeConfig> {
        BridgeConfig::parse(text, "bridge.txt", &HashMap::new())
    }

    fn message(result: Result<BridgeConfig>) -> String {
        match result {
            Err(InterfaceError::Config(err)) => err.message,
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    const BRIDGE: &str = r#"
VARIABLE port 8080
VARIABLE host localhost
INTERFACE inst_int tcpip_client_interface.py <%= host %> <%= port %> <%= port %> 10.0 nil
  PROTOCOL READ_WRITE LengthProtocol 0 16
  PROTOCOL write crc_protocol.py CRC
  OPTION custom a b
  RECONNECT_DELAY 2.5
  LOG_RAW
ROUTER inst_router TCPIP_SERVER 2950 2950 10.0 nil BURST
  ROUTE INST_INT
  ROUTE inst_int
"#;

    #[test]
    fn test_parse_bridge() {
        let config = parse(BRIDGE).unwrap();
        let interface = config.interface("INST_INT").unwrap();
        assert_eq!(
            interface.spec.link,
            registry::LinkSpec::TcpClient {
                host: "localhost".to_string(),
                write_port: Some(8080),
                read_port: Some(8080),
                write_timeout: Some(Duration::from_secs(10)),
                read_timeout: None,
            }
        );
        assert_eq!(interface.protocols.len(), 2);
        assert_eq!(interface.protocols[0].name, "LENGTH_PROTOCOL");
        assert_eq!(interface.protocols[1].kind, ProtocolKind::Write);
        assert_eq!(
            interface.options.get("CUSTOM"),
            Some(&vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(interface.reconnect_delay, Some(Duration::from_millis(2500)));
        assert_eq!(interface.log_stream, Some(Vec::new()));

        let router = config.router("inst_router").unwrap();
        assert_eq!(router.routes, vec!["INST_INT".to_string()]);
        assert_eq!(router.spec.protocol, Some(("BURST".to_string(), Vec::new())));
        assert_eq!(config.variables().get("port").map(String::as_str), Some("8080"));
    }

    #[test]
    fn test_variable_overrides() {
        let overrides = HashMap::from([("port".to_string(), "9090".to_string())]);
        let config = BridgeConfig::parse(BRIDGE, "bridge.txt", &overrides).unwrap();
        let registry::LinkSpec::TcpClient { write_port, .. } = &config.interfaces()[0].spec.link
        else {
            panic!("expected a tcp client");
        };
        assert_eq!(*write_port, Some(9090));
    }

    #[test]
    fn test_duplicate_and_undefined_names() {
        let duplicate = "INTERFACE FOO TCPIP_SERVER 1 1 nil nil\nINTERFACE foo TCPIP_SERVER 2 2 nil nil\n";
        assert_eq!(message(parse(duplicate)), "Interface 'FOO' defined twice");

        let duplicate = "ROUTER R TCPIP_SERVER 1 1 nil nil\nROUTER R TCPIP_SERVER 2 2 nil nil\n";
        assert_eq!(message(parse(duplicate)), "Router 'R' defined twice");

        let undefined = "ROUTER R TCPIP_SERVER 1 1 nil nil\n  ROUTE UNDEFINED_INTERFACE\n";
        assert_eq!(
            message(parse(undefined)),
            "Unknown interface UNDEFINED_INTERFACE mapped to router R"
        );

        let no_router = "INTERFACE FOO TCPIP_SERVER 1 1 nil nil\n  ROUTE FOO\n";
        assert_eq!(message(parse(no_router)), "No current router for ROUTE");
    }

    #[test]
    fn test_keyword_errors() {
        assert_eq!(
            message(parse("OPTION LISTEN_ADDRESS 0.0.0.0\n")),
            "No current interface or router for OPTION"
        );
        assert_eq!(message(parse("BOGUS 1\n")), "Unknown keyword: BOGUS");

        let bad_kind = "INTERFACE FOO TCPIP_SERVER 1 1 nil nil\n  PROTOCOL BOTH BURST\n";
        assert_eq!(message(parse(bad_kind)), "Invalid protocol type: BOTH");

        let bad_protocol = "INTERFACE FOO TCPIP_SERVER 1 1 nil nil\n  PROTOCOL READ COBS\n";
        assert_eq!(message(parse(bad_protocol)), "unknown protocol COBS");

        let bad_impl = "INTERFACE FOO udp_interface.py 1 1\n";
        let err = parse(bad_impl).unwrap_err();
        assert!(err.to_string().starts_with("bridge.txt:1: unknown interface udp_interface.py"));

        let unknown_variable = "INTERFACE FOO TCPIP_SERVER <%= port %> 1 nil nil\n";
        assert_eq!(message(parse(unknown_variable)), "Unknown variable 'port'");
    }

    #[test]
    fn test_generate_default_parses() {
        let path = std::env::temp_dir().join(format!(
            "linkprims-bridge-config-default-{}-{}.txt",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        BridgeConfig::generate_default(&path).unwrap();

        let config = BridgeConfig::from_file(&path, &HashMap::new()).unwrap();
        assert_eq!(config.interfaces()[0].name, "SERIAL_INT");
        let router = config.router("SERIAL_ROUTER").unwrap();
        assert_eq!(router.routes, vec!["SERIAL_INT".to_string()]);
        assert_eq!(
            router.options.get("LISTEN_ADDRESS"),
            Some(&vec!["127.0.0.1".to_string()])
        );
        std::fs::remove_file(path).unwrap();
    }
}
