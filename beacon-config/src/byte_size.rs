use std::fmt;
use std::str::FromStr;

use human_size::{Byte, Size, SpecificSize};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

pub use human_size::ParsingError as ByteSizeParseError;

/// Binary and decimal units used to render a [`ByteSize`], largest first.
const UNITS: &[(u64, &str)] = &[
    (1 << 30, "GiB"),
    (1_000_000_000, "GB"),
    (1 << 20, "MiB"),
    (1_000_000, "MB"),
    (1 << 10, "KiB"),
    (1_000, "kB"),
];

/// A size in bytes, configurable as an integer or a human readable string like `"5MiB"`.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Creates a byte size from bytes.
    pub const fn bytes(value: u64) -> Self {
        Self(value)
    }

    /// Creates a byte size from kibibytes.
    pub const fn kibibytes(value: u64) -> Self {
        Self(value * 1024)
    }

    /// Creates a byte size from mebibytes.
    pub const fn mebibytes(value: u64) -> Self {
        Self(value * 1024 * 1024)
    }

    /// Returns the value in bytes.
    pub fn as_bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = ByteSizeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if let Ok(bytes) = value.trim().parse::<u64>() {
            return Ok(Self(bytes));
        }

        let size: Size = value.trim().parse()?;
        let bytes: SpecificSize<Byte> = size.into();
        Ok(Self(bytes.value().max(0.0) as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes > 0 {
            for &(factor, unit) in UNITS {
                if bytes % factor == 0 {
                    return write!(f, "{}{}", bytes / factor, unit);
                }
            }
        }

        write!(f, "{bytes}B")
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteSize({self})")
    }
}

impl From<u64> for ByteSize {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;

        impl de::Visitor<'_> for V {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("data size")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<ByteSize, E> {
                u64::try_from(value)
                    .map(ByteSize)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(value), &self))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<ByteSize, E> {
                value
                    .parse()
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(V)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        let size: ByteSize = "42MiB".parse().unwrap();
        assert_eq!(size.as_bytes(), 44_040_192);
        assert_eq!(size.to_string(), "42MiB");

        let size: ByteSize = "1kB".parse().unwrap();
        assert_eq!(size.as_bytes(), 1000);

        let size: ByteSize = "1500".parse().unwrap();
        assert_eq!(size.to_string(), "1500B");
    }

    #[test]
    fn test_display_prefers_binary() {
        assert_eq!(ByteSize::kibibytes(1).to_string(), "1KiB");
        assert_eq!(ByteSize::bytes(2_000_000).to_string(), "2MB");
        assert_eq!(ByteSize::bytes(0).to_string(), "0B");
    }

    #[test]
    fn test_deserialize_int_or_string() {
        let sizes: Vec<ByteSize> = serde_json::from_str(r#"[1024, "5MiB"]"#).unwrap();
        assert_eq!(sizes, [ByteSize::kibibytes(1), ByteSize::mebibytes(5)]);

        assert!(serde_json::from_str::<ByteSize>(r#""lots""#).is_err());
    }
}
