//! Typed configuration values that accept human-friendly spellings.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// Link bandwidth in bytes per second, or `auto` to take the device default.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Bandwidth {
    #[default]
    Auto,
    BytesPerSec(f64),
}

const BANDWIDTH_UNITS: &[(&str, f64)] = &[
    ("GBps", 1e9),
    ("MBps", 1e6),
    ("KBps", 1e3),
    ("Bps", 1.0),
    ("Gbps", 1e9 / 8.0),
    ("Mbps", 1e6 / 8.0),
    ("Kbps", 1e3 / 8.0),
    ("bps", 1.0 / 8.0),
];

impl Bandwidth {
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        let (number, scale) = BANDWIDTH_UNITS
            .iter()
            .find_map(|(unit, scale)| input.strip_suffix(unit).map(|n| (n, *scale)))
            .unwrap_or((input, 1.0));
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| format!("invalid bandwidth `{input}`"))?;
        if !(value.is_finite() && value > 0.0) {
            return Err(format!("bandwidth must be positive: `{input}`"));
        }
        Ok(Self::BytesPerSec(value * scale))
    }

    pub fn resolve(self, auto: f64) -> f64 {
        match self {
            Self::Auto => auto,
            Self::BytesPerSec(value) => value,
        }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::BytesPerSec(value) => write!(f, "{value}Bps"),
        }
    }
}

impl Serialize for Bandwidth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Bandwidth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BandwidthVisitor;

        impl<'de> Visitor<'de> for BandwidthVisitor {
            type Value = Bandwidth;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("`auto`, a number, or a number with a unit like `12.5GBps`")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Bandwidth, E> {
                Bandwidth::parse(value).map_err(E::custom)
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Bandwidth, E> {
                Bandwidth::parse(&value.to_string()).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Bandwidth, E> {
                Bandwidth::parse(&value.to_string()).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Bandwidth, E> {
                Bandwidth::parse(&value.to_string()).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(BandwidthVisitor)
    }
}

/// `on` / `off` / `auto` switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ternary {
    On,
    Off,
    #[default]
    Auto,
}

impl Ternary {
    pub fn parse(input: &str) -> Result<Self, String> {
        match input.trim().to_ascii_lowercase().as_str() {
            "on" | "yes" | "y" | "true" | "1" => Ok(Self::On),
            "off" | "no" | "n" | "false" | "0" => Ok(Self::Off),
            "auto" | "try" => Ok(Self::Auto),
            other => Err(format!("expected on/off/auto, got `{other}`")),
        }
    }

    pub fn resolve(self, auto: bool) -> bool {
        match self {
            Self::On => true,
            Self::Off => false,
            Self::Auto => auto,
        }
    }
}

impl fmt::Display for Ternary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Auto => "auto",
        })
    }
}

impl Serialize for Ternary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ternary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TernaryVisitor;

        impl<'de> Visitor<'de> for TernaryVisitor {
            type Value = Ternary;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("on, off or auto")
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<Ternary, E> {
                Ok(if value { Ternary::On } else { Ternary::Off })
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Ternary, E> {
                Ternary::parse(&value.to_string()).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Ternary, E> {
                Ternary::parse(&value.to_string()).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Ternary, E> {
                Ternary::parse(value).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(TernaryVisitor)
    }
}

/// Names to include, or with a leading `^` names to exclude. Empty allows
/// everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllowList {
    pub negate: bool,
    pub names: Vec<String>,
}

impl AllowList {
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let (negate, rest) = match input.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, input),
        };
        Self {
            negate,
            names: split_list(rest),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        if self.names.is_empty() {
            return true;
        }
        self.names.iter().any(|n| n == name) != self.negate
    }
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(|c| c == ',' || c == ';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            f.write_str("^")?;
        }
        f.write_str(&self.names.join(","))
    }
}

impl Serialize for AllowList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AllowList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AllowListVisitor;

        impl<'de> Visitor<'de> for AllowListVisitor {
            type Value = AllowList;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a comma separated list, optionally prefixed with ^")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<AllowList, E> {
                Ok(AllowList::parse(value))
            }

            fn visit_seq<S: SeqAccess<'de>>(self, mut seq: S) -> Result<AllowList, S::Error> {
                let mut names = Vec::new();
                while let Some(name) = seq.next_element::<String>()? {
                    names.push(name);
                }
                Ok(AllowList {
                    negate: false,
                    names,
                })
            }
        }

        deserializer.deserialize_any(AllowListVisitor)
    }
}

/// `key=value` pairs, written `a=1,b=2` or as a table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct KeyValues(pub BTreeMap<String, String>);

impl KeyValues {
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut map = BTreeMap::new();
        for item in split_list(input) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got `{item}`"))?;
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self(map))
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, String> {
        match self.0.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| format!("invalid value for `{key}`: `{raw}`")),
        }
    }
}

impl fmt::Display for KeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&pairs.join(","))
    }
}

impl<'de> Deserialize<'de> for KeyValues {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyValuesVisitor;

        impl<'de> Visitor<'de> for KeyValuesVisitor {
            type Value = KeyValues;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("key=value pairs or a table")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<KeyValues, E> {
                KeyValues::parse(value).map_err(E::custom)
            }

            fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<KeyValues, M::Error> {
                let mut map = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, ScalarString>()? {
                    map.insert(key, value.0);
                }
                Ok(KeyValues(map))
            }
        }

        deserializer.deserialize_any(KeyValuesVisitor)
    }
}

/// Any scalar rendered back to text, so tables may hold numbers.
struct ScalarString(String);

impl<'de> Deserialize<'de> for ScalarString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScalarVisitor;

        impl<'de> Visitor<'de> for ScalarVisitor {
            type Value = ScalarString;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a scalar")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ScalarString, E> {
                Ok(ScalarString(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}
