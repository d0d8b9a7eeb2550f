//! MAC address value object

use crate::CommonError;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Hardware address of a network device (Value Object)
///
/// # Invariants
/// - Exactly 6 octets
/// - Rendered as lower-case, colon separated text (`00:11:22:aa:bb:cc`)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Create from raw octets
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Raw octets
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = CommonError;

    /// Accepts `:`, `-` and `_` separators (or none) in any letter case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<u8> = s
            .bytes()
            .filter(|b| !matches!(b, b':' | b'-' | b'_'))
            .collect();
        if digits.len() != 12 || !digits.iter().all(u8::is_ascii_hexdigit) {
            return Err(CommonError::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (i, pair) in digits.chunks(2).enumerate() {
            let hex = std::str::from_utf8(pair).map_err(|_| CommonError::InvalidMac(s.to_string()))?;
            octets[i] = u8::from_str_radix(hex, 16).map_err(|_| CommonError::InvalidMac(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_separators_and_case() {
        let expected = MacAddress::new([0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03]);
        for text in ["aa:bb:cc:01:02:03", "AA-BB-CC-01-02-03", "aabb_cc01_0203", "AABBCC010203"] {
            assert_eq!(text.parse::<MacAddress>().unwrap(), expected, "{text}");
        }
    }

    #[test]
    fn test_rejects_malformed() {
        for text in ["", "aa:bb:cc:dd:ee", "aa:bb:cc:dd:ee:ff:00", "zz:bb:cc:dd:ee:ff", "aa bb cc dd ee ff"] {
            assert!(text.parse::<MacAddress>().is_err(), "{text}");
        }
    }

    #[test]
    fn test_display_is_canonical() {
        let mac: MacAddress = "00-1A-2b-3C-4d-5E".parse().unwrap();
        assert_eq!(mac.to_string(), "00:1a:2b:3c:4d:5e");
    }

    #[test]
    fn test_serde_as_string() {
        let mac: MacAddress = "00:11:22:33:44:55".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"00:11:22:33:44:55\"");
        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }
}
