//! Byte quantities with human-readable parsing and formatting

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

/// A non-negative number of bytes.
///
/// Parses `"512"`, `"64KB"`, `"1.5GB"`, `"2GiB"`; decimal suffixes are powers
/// of 1000, `i` suffixes powers of 1024.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteCount(u64);

impl ByteCount {
    pub const ZERO: ByteCount = ByteCount(0);

    pub const fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, other: ByteCount) -> ByteCount {
        ByteCount(self.0.saturating_sub(other.0))
    }
}

impl From<u64> for ByteCount {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Add for ByteCount {
    type Output = ByteCount;
    fn add(self, rhs: ByteCount) -> ByteCount {
        ByteCount(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for ByteCount {
    fn add_assign(&mut self, rhs: ByteCount) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for ByteCount {
    type Output = ByteCount;
    fn sub(self, rhs: ByteCount) -> ByteCount {
        self.saturating_sub(rhs)
    }
}

impl SubAssign for ByteCount {
    fn sub_assign(&mut self, rhs: ByteCount) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl std::iter::Sum for ByteCount {
    fn sum<I: Iterator<Item = ByteCount>>(iter: I) -> Self {
        iter.fold(ByteCount::ZERO, Add::add)
    }
}

const UNITS: &[(&str, u64)] = &[
    ("TIB", 1 << 40),
    ("GIB", 1 << 30),
    ("MIB", 1 << 20),
    ("KIB", 1 << 10),
    ("TB", 1_000_000_000_000),
    ("GB", 1_000_000_000),
    ("MB", 1_000_000),
    ("KB", 1_000),
    ("B", 1),
];

#[derive(Debug, thiserror::Error)]
#[error("invalid byte count '{0}'")]
pub struct ByteCountParseError(String);

impl FromStr for ByteCount {
    type Err = ByteCountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || ByteCountParseError(s.to_string());
        if trimmed.is_empty() {
            return Err(err());
        }
        let upper = trimmed.to_ascii_uppercase();
        let (number, multiplier) = UNITS
            .iter()
            .find_map(|(suffix, mult)| {
                upper
                    .strip_suffix(suffix)
                    .map(|rest| (rest.trim().to_string(), *mult))
            })
            .unwrap_or((upper.clone(), 1));

        if let Ok(whole) = number.parse::<u64>() {
            return whole.checked_mul(multiplier).map(ByteCount).ok_or_else(err);
        }
        let fractional: f64 = number.parse().map_err(|_| err())?;
        if !fractional.is_finite() || fractional < 0.0 {
            return Err(err());
        }
        let bytes = fractional * multiplier as f64;
        if bytes > u64::MAX as f64 {
            return Err(err());
        }
        Ok(ByteCount(bytes.round() as u64))
    }
}

impl fmt::Display for ByteCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SCALE: &[(&str, u64)] = &[
            ("TB", 1_000_000_000_000),
            ("GB", 1_000_000_000),
            ("MB", 1_000_000),
            ("KB", 1_000),
        ];
        for (suffix, unit) in SCALE {
            if self.0 >= *unit {
                let value = self.0 as f64 / *unit as f64;
                return if self.0 % unit == 0 {
                    write!(f, "{}{suffix}", self.0 / unit)
                } else {
                    write!(f, "{value:.1}{suffix}")
                };
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl Serialize for ByteCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(ByteCount(n)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
