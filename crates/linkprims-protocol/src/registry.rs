use crate::burst::BurstProtocol;
use crate::crc::CrcProtocol;
use crate::encryption::EncryptionProtocol;
use crate::error::{ProtocolError, Result};
use crate::fixed::FixedProtocol;
use crate::length::LengthProtocol;
use crate::preidentified::PreidentifiedProtocol;
use crate::protocol::Protocol;
use crate::slip::SlipProtocol;
use crate::template::TemplateProtocol;
use crate::terminated::TerminatedProtocol;

type Constructor = fn(&[String]) -> Result<Box<dyn Protocol>>;

fn boxed<P: Protocol + 'static>(result: Result<P>) -> Result<Box<dyn Protocol>> {
    result.map(|protocol| Box::new(protocol) as Box<dyn Protocol>)
}

const PROTOCOLS: &[(&str, Constructor)] = &[
    ("BURST", |args| boxed(BurstProtocol::from_args(args))),
    ("LENGTH", |args| boxed(LengthProtocol::from_args(args))),
    ("TERMINATED", |args| boxed(TerminatedProtocol::from_args(args))),
    ("FIXED", |args| boxed(FixedProtocol::from_args(args))),
    ("CRC", |args| boxed(CrcProtocol::from_args(args))),
    ("SLIP", |args| boxed(SlipProtocol::from_args(args))),
    ("PREIDENTIFIED", |args| boxed(PreidentifiedProtocol::from_args(args))),
    ("ENCRYPTION", |args| boxed(EncryptionProtocol::from_args(args))),
    ("TEMPLATE", |args| boxed(TemplateProtocol::from_args(args))),
];

/// Strip an optional `_PROTOCOL` suffix and upper-case.
fn normalize(name: &str) -> String {
    let upper = name.to_ascii_uppercase();
    upper
        .strip_suffix("_PROTOCOL")
        .map(str::to_string)
        .unwrap_or(upper)
}

/// Registered protocol names.
pub fn names() -> impl Iterator<Item = &'static str> {
    PROTOCOLS.iter().map(|(name, _)| *name)
}

pub fn is_registered(name: &str) -> bool {
    let name = normalize(name);
    PROTOCOLS.iter().any(|(registered, _)| *registered == name)
}

/// Build a protocol from a config line's name and positional arguments.
/// `LENGTH` and `LENGTH_PROTOCOL` name the same protocol.
pub fn create(name: &str, args: &[String]) -> Result<Box<dyn Protocol>> {
    let normalized = normalize(name);
    let (_, constructor) = PROTOCOLS
        .iter()
        .find(|(registered, _)| *registered == normalized)
        .ok_or_else(|| ProtocolError::UnknownProtocol(name.to_string()))?;
    constructor(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_by_name() {
        let args: Vec<String> = vec!["0x0A".into(), "0x0A".into()];
        let protocol = create("terminated_protocol", &args).unwrap();
        assert_eq!(protocol.name(), "TERMINATED");
        assert_eq!(create("BURST", &[]).unwrap().name(), "BURST");
        assert!(is_registered("Slip"));
        assert_eq!(create("Template_Protocol", &args).unwrap().name(), "TEMPLATE");
        assert_eq!(names().count(), 9);
    }

    #[test]
    fn test_unknown_and_bad_args() {
        assert!(matches!(
            create("COBS", &[]),
            Err(ProtocolError::UnknownProtocol(name)) if name == "COBS"
        ));
        assert!(create("FIXED", &[]).is_err());
    }
}
