use std::{collections::BTreeMap, fmt, ops::Index, str::FromStr};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

/// Water-quality measurements keyed by name (`ph`, `kh`, `gh`, `no2`, `no3`, `cl2`, ...).
///
/// Keys are not schema-enforced and keep the order they were submitted in. A
/// `None` value means the reading was left blank.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaterData(Vec<(String, Option<f64>)>);

impl WaterData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Option<f64>> {
        self.0
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| *value)
    }

    /// Sets `key`. An existing key keeps its position.
    pub fn insert(&mut self, key: String, value: Option<f64>) {
        match self.0.iter_mut().find(|(name, _)| *name == key) {
            Some(reading) => reading.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

impl FromIterator<(String, Option<f64>)> for WaterData {
    fn from_iter<I: IntoIterator<Item = (String, Option<f64>)>>(iter: I) -> Self {
        let mut data = Self::new();
        for (key, value) in iter {
            data.insert(key, value);
        }
        data
    }
}

impl Index<&str> for WaterData {
    type Output = Option<f64>;

    fn index(&self, key: &str) -> &Self::Output {
        match self.0.iter().find(|(name, _)| name == key) {
            Some((_, value)) => value,
            None => panic!("no reading named `{key}`"),
        }
    }
}

impl Serialize for WaterData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(name, value)| (name, value)))
    }
}

struct WaterDataVisitor;

impl<'de> Visitor<'de> for WaterDataVisitor {
    type Value = WaterData;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of numeric readings")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut data = WaterData::new();
        while let Some((key, value)) = map.next_entry::<String, Option<f64>>()? {
            data.insert(key, value);
        }
        Ok(data)
    }
}

impl<'de> Deserialize<'de> for WaterData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(WaterDataVisitor)
    }
}

/// Measurements detected on a test strip. Undetected keys are absent, never zero.
pub type ExtractionResult = BTreeMap<String, f64>;

pub const FISH_TYPE_MAX_LEN: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TankType {
    #[default]
    Freshwater,
    Saltwater,
    Brackish,
}

impl TankType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Freshwater => "freshwater",
            Self::Saltwater => "saltwater",
            Self::Brackish => "brackish",
        }
    }
}

impl fmt::Display for TankType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown tank type `{0}`")]
pub struct UnknownTankType(String);

impl FromStr for TankType {
    type Err = UnknownTankType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "freshwater" => Ok(Self::Freshwater),
            "saltwater" => Ok(Self::Saltwater),
            "brackish" => Ok(Self::Brackish),
            other => Err(UnknownTankType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub date_joined: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub user: i64,
    pub user_username: String,
    pub log_date: NaiveDate,
    pub water_data: WaterData,
    pub fish_type: Option<String>,
    pub tank_type: TankType,
    pub notes: Option<String>,
    pub updated_at: NaiveDateTime,
}

/// The writable part of a [`LogEntry`], as sent on create and full update.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogEntryInput {
    pub water_data: WaterData,
    pub fish_type: Option<String>,
    pub tank_type: TankType,
    pub notes: Option<String>,
}

/// A partial update. Absent fields are left untouched; `null` clears nullable ones.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogEntryPatch {
    pub water_data: Option<WaterData>,
    #[serde(deserialize_with = "present")]
    pub fish_type: Option<Option<String>>,
    pub tank_type: Option<TankType>,
    #[serde(deserialize_with = "present")]
    pub notes: Option<Option<String>>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl LogEntryPatch {
    pub fn apply(self, entry: &LogEntry) -> LogEntryInput {
        LogEntryInput {
            water_data: self
                .water_data
                .unwrap_or_else(|| entry.water_data.clone()),
            fish_type: self.fish_type.unwrap_or_else(|| entry.fish_type.clone()),
            tank_type: self.tank_type.unwrap_or(entry.tank_type),
            notes: self.notes.unwrap_or_else(|| entry.notes.clone()),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("fish_type must be at most 100 characters")]
pub struct FishTypeTooLong;

impl LogEntryInput {
    pub fn validate(&self) -> Result<(), FishTypeTooLong> {
        match &self.fish_type {
            Some(fish) if fish.chars().count() > FISH_TYPE_MAX_LEN => Err(FishTypeTooLong),
            _ => Ok(()),
        }
    }
}

/// Renders the non-null readings as `key: value, key: value`, in submission order.
///
/// Values always carry a fractional part (`7.0`, not `7`).
pub fn format_readings(data: &WaterData) -> Option<String> {
    let parts: Vec<_> = data
        .iter()
        .filter_map(|(key, value)| value.map(|value| format!("{key}: {value:?}")))
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}
