//! Configuration key registry and `UBX-CFG-VALSET` encoding.
//!
//! Keys are loaded from an interface description file with one definition
//! per line:
//!
//! ```text
//! CFG-RATE-MEAS 0x30210001 U2
//! CFG-UART1-BAUDRATE 0x40520001 U4
//! ```
//!
//! Requested settings come from a config file with `NAME VALUE` per line.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};
use crate::ubx_frame::build_frame;

pub const UBX_CLASS_CFG: u8 = 0x06;
pub const UBX_CFG_VALSET: u8 = 0x8A;

const VALSET_VERSION: u8 = 0x00;
const LAYER_RAM: u8 = 1 << 0;
const LAYER_FLASH: u8 = 1 << 2;

/// Storage width of a configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    U1,
    U2,
    U4,
    /// Any tag the encoder cannot write yet (`L`, `E1`, `I2`, `R8`...).
    Unsupported(String),
}

impl From<&str> for ValueType {
    fn from(tag: &str) -> Self {
        match tag {
            "U1" => Self::U1,
            "U2" => Self::U2,
            "U4" => Self::U4,
            other => Self::Unsupported(other.to_string()),
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::U1 => write!(f, "U1"),
            Self::U2 => write!(f, "U2"),
            Self::U4 => write!(f, "U4"),
            Self::Unsupported(tag) => write!(f, "{tag}"),
        }
    }
}

/// A single configuration item definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    /// 32-bit configuration key id
    pub key: u32,
    /// Value storage type
    pub value_type: ValueType,
}

/// Name to definition lookup table.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    definitions: HashMap<String, Definition>,
}

impl Registry {
    /// Loads definitions from any line oriented source.
    ///
    /// Blank lines are ignored. Every other line must hold exactly three
    /// whitespace separated tokens, and a later definition of the same name
    /// replaces the earlier one.
    pub fn load<R: BufRead>(source: R) -> Result<Self> {
        let mut definitions = HashMap::new();
        for line in source.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            let [name, key, tag] = parts[..] else {
                return Err(Error::CorruptDefinition { line });
            };
            let hex = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")).unwrap_or(key);
            let Ok(key) = u32::from_str_radix(hex, 16) else {
                return Err(Error::CorruptDefinition { line });
            };
            let value_type = ValueType::from(tag);
            definitions.insert(name.to_string(), Definition { key, value_type });
        }
        Ok(Self { definitions })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(BufReader::new(File::open(path)?))
    }

    /// Looks up a definition by name.
    pub fn lookup(&self, name: &str) -> Result<&Definition> {
        self.definitions
            .get(name)
            .ok_or_else(|| Error::UnknownConfigKey(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// One requested setting, read from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRequest {
    pub key: String,
    pub value: i64,
}

impl ConfigRequest {
    pub fn new(key: impl Into<String>, value: i64) -> Self {
        Self { key: key.into(), value }
    }
}

/// Parses `NAME VALUE` lines into requests, in file order.
pub fn parse_config_requests<R: BufRead>(source: R) -> Result<Vec<ConfigRequest>> {
    let mut requests = Vec::new();
    for line in source.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [key, value] = parts[..] else {
            return Err(Error::CorruptConfig { line });
        };
        let parsed = value.parse::<i64>().map_err(|_| Error::InvalidConfigValue {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        requests.push(ConfigRequest::new(key, parsed));
    }
    Ok(requests)
}

/// Persistence layers a `CFG-VALSET` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layers {
    pub ram: bool,
    pub flash: bool,
}

impl Default for Layers {
    fn default() -> Self {
        Self { ram: true, flash: false }
    }
}

impl Layers {
    /// Layer bitfield: bit 0 RAM, bit 2 FLASH.
    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.ram {
            bits |= LAYER_RAM;
        }
        if self.flash {
            bits |= LAYER_FLASH;
        }
        bits
    }
}

/// Encodes a key id followed by its value, both little endian.
pub fn encode_key_value(name: &str, value: i64, registry: &Registry) -> Result<Vec<u8>> {
    let definition = registry.lookup(name)?;
    let out_of_range = |tag| Error::ValueOutOfRange { key: name.to_string(), value, tag };

    let mut pair = definition.key.to_le_bytes().to_vec();
    match &definition.value_type {
        ValueType::U1 => {
            let v = u8::try_from(value).map_err(|_| out_of_range("U1"))?;
            pair.push(v);
        }
        ValueType::U2 => {
            let v = u16::try_from(value).map_err(|_| out_of_range("U2"))?;
            pair.extend_from_slice(&v.to_le_bytes());
        }
        ValueType::U4 => {
            let v = u32::try_from(value).map_err(|_| out_of_range("U4"))?;
            pair.extend_from_slice(&v.to_le_bytes());
        }
        ValueType::Unsupported(tag) => {
            return Err(Error::UnsupportedValueType {
                key: name.to_string(),
                tag: tag.clone(),
            });
        }
    }
    Ok(pair)
}

/// Wraps encoded key/value pairs into a `UBX-CFG-VALSET` frame.
pub fn build_config_set_frame(pairs: &[u8], layers: Layers) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + pairs.len());
    payload.push(VALSET_VERSION);
    payload.push(layers.bits());
    payload.extend_from_slice(&[0, 0]);
    payload.extend_from_slice(pairs);
    build_frame(UBX_CLASS_CFG, UBX_CFG_VALSET, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ubx_frame::decode;
    use rstest::rstest;

    const DEFINITIONS: &str = "\
CFG-RATE-MEAS 0x30210001 U2
CFG-UART1-BAUDRATE 0x40520001 U4
CFG-NAVSPG-DYNMODEL 0x20110021 E1
CFG-MSGOUT-UBX_NAV_PVT_USB 0x20910009 U1
";

    fn registry() -> Registry {
        Registry::load(DEFINITIONS.as_bytes()).unwrap()
    }

    #[test]
    fn test_load_definitions() {
        let registry = registry();
        assert_eq!(registry.len(), 4);
        let def = registry.lookup("CFG-RATE-MEAS").unwrap();
        assert_eq!(def.key, 0x30210001);
        assert_eq!(def.value_type, ValueType::U2);
        assert_eq!(
            registry.lookup("CFG-NAVSPG-DYNMODEL").unwrap().value_type,
            ValueType::Unsupported("E1".to_string())
        );
    }

    #[test]
    fn test_hex_key_without_prefix() {
        let registry = Registry::load("CFG-RATE-NAV 30210002 U2\n".as_bytes()).unwrap();
        assert_eq!(registry.lookup("CFG-RATE-NAV").unwrap().key, 0x30210002);
    }

    #[test]
    fn test_duplicate_definition_overwrites() {
        let source = "CFG-A 0x10 U1\nCFG-A 0x20 U4\n";
        let registry = Registry::load(source.as_bytes()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup("CFG-A").unwrap(),
            &Definition { key: 0x20, value_type: ValueType::U4 }
        );
    }

    #[rstest]
    #[case("CFG-A 0x10")]
    #[case("CFG-A 0x10 U1 extra")]
    #[case("CFG-A")]
    #[case("CFG-A zz U1")]
    fn test_corrupt_definition(#[case] line: &str) {
        let source = format!("CFG-OK 0x1 U1\n{line}\n");
        match Registry::load(source.as_bytes()) {
            Err(Error::CorruptDefinition { line: bad }) => assert_eq!(bad, line),
            other => panic!("expected CorruptDefinition, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_key() {
        assert!(matches!(registry().lookup("CFG-NOPE"), Err(Error::UnknownConfigKey(k)) if k == "CFG-NOPE"));
        assert!(matches!(
            encode_key_value("CFG-NOPE", 1, &registry()),
            Err(Error::UnknownConfigKey(_))
        ));
    }

    #[rstest]
    #[case("CFG-MSGOUT-UBX_NAV_PVT_USB", 1, vec![0x09, 0x00, 0x91, 0x20, 0x01])]
    #[case("CFG-RATE-MEAS", 100, vec![0x01, 0x00, 0x21, 0x30, 0x64, 0x00])]
    #[case("CFG-UART1-BAUDRATE", 460800, vec![0x01, 0x00, 0x52, 0x40, 0x00, 0x08, 0x07, 0x00])]
    fn test_encode_key_value(#[case] name: &str, #[case] value: i64, #[case] expected: Vec<u8>) {
        assert_eq!(encode_key_value(name, value, &registry()).unwrap(), expected);
    }

    #[test]
    fn test_unsupported_value_type() {
        match encode_key_value("CFG-NAVSPG-DYNMODEL", 4, &registry()) {
            Err(Error::UnsupportedValueType { key, tag }) => {
                assert_eq!(key, "CFG-NAVSPG-DYNMODEL");
                assert_eq!(tag, "E1");
            }
            other => panic!("expected UnsupportedValueType, got {other:?}"),
        }
    }

    #[rstest]
    #[case("CFG-MSGOUT-UBX_NAV_PVT_USB", 256)]
    #[case("CFG-RATE-MEAS", 65536)]
    #[case("CFG-UART1-BAUDRATE", -1)]
    fn test_value_out_of_range(#[case] name: &str, #[case] value: i64) {
        assert!(matches!(
            encode_key_value(name, value, &registry()),
            Err(Error::ValueOutOfRange { .. })
        ));
    }

    #[rstest]
    #[case(Layers { ram: true, flash: false }, 0x01)]
    #[case(Layers { ram: true, flash: true }, 0x05)]
    #[case(Layers { ram: false, flash: true }, 0x04)]
    #[case(Layers { ram: false, flash: false }, 0x00)]
    fn test_layer_bits(#[case] layers: Layers, #[case] bits: u8) {
        assert_eq!(layers.bits(), bits);
    }

    #[test]
    fn test_config_set_frame() {
        let pair = encode_key_value("CFG-RATE-MEAS", 100, &registry()).unwrap();
        let frame = decode(&build_config_set_frame(&pair, Layers { ram: true, flash: true })).unwrap();
        assert_eq!((frame.class, frame.id), (0x06, 0x8A));
        assert_eq!(frame.payload, vec![0x00, 0x05, 0x00, 0x00, 0x01, 0x00, 0x21, 0x30, 0x64, 0x00]);
    }

    #[test]
    fn test_parse_config_requests() {
        let source = "CFG-RATE-MEAS 100\n\nCFG-UART1-BAUDRATE 460800\n";
        let requests = parse_config_requests(source.as_bytes()).unwrap();
        assert_eq!(
            requests,
            vec![
                ConfigRequest::new("CFG-RATE-MEAS", 100),
                ConfigRequest::new("CFG-UART1-BAUDRATE", 460800)
            ]
        );
        assert!(matches!(
            parse_config_requests("CFG-RATE-MEAS 100 7\n".as_bytes()),
            Err(Error::CorruptConfig { .. })
        ));
        assert!(matches!(
            parse_config_requests("CFG-RATE-MEAS fast\n".as_bytes()),
            Err(Error::InvalidConfigValue { .. })
        ));
    }
}
