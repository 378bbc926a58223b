// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Support for byte units like "KB / KiB", "MB / MiB", "GB / GiB" in configuration files.

use byte_unit::Byte;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Value {
    Number(u64),
    String(String),
}

/// Deserialize a byte size that can be specified either as a number (in bytes)
/// or as a string with units (e.g. "8 MiB", "512MB").
pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let bytes = match value {
        Value::Number(value) => value,
        Value::String(text) => {
            let parsed: Byte = text.parse().map_err(DeError::custom)?;
            parsed.as_u64()
        }
    };
    Ok(bytes)
}

/// Parse a byte size from a plain string, for environment overrides.
pub fn parse(text: &str) -> Result<u64, String> {
    if let Ok(raw) = text.parse::<u64>() {
        return Ok(raw);
    }
    let parsed: Byte = text.parse().map_err(|e| format!("{e}"))?;
    Ok(parsed.as_u64())
}

#[cfg(test)]
mod tests {
    use super::deserialize;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Holder {
        #[serde(deserialize_with = "deserialize")]
        value: u64,
    }

    fn de_yaml(input: &str) -> Result<Holder, serde_yaml::Error> {
        serde_yaml::from_str::<Holder>(input)
    }

    #[test]
    fn parses_number_as_bytes() {
        let cfg = de_yaml("value: 1024").expect("should parse numeric bytes");
        assert_eq!(cfg.value, 1024);
    }

    #[test]
    fn parses_string_with_iec_units() {
        let cfg = de_yaml("value: 1 KiB").expect("should parse 1 KiB");
        assert_eq!(cfg.value, 1024);

        let cfg = de_yaml("value: '32 MiB'").expect("should parse 32 MiB");
        assert_eq!(cfg.value, 32 * 1024 * 1024);
    }

    #[test]
    fn parses_plain_string_number() {
        let cfg = de_yaml("value: '2048'").expect("should parse plain numeric string");
        assert_eq!(cfg.value, 2048);
    }

    #[test]
    fn env_parse_accepts_units() {
        assert_eq!(super::parse("64 MiB").expect("parse"), 64 * 1024 * 1024);
        assert_eq!(super::parse("1000").expect("parse"), 1000);
    }
}
