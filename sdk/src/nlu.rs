//! Normalized natural-language-understanding data
//!
//! These types are what the engine consumes, whatever vendor produced them.
//! They are plain serde data so persistence adapters can store them without
//! losing the entity value shape.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::EngineError;

/// Kind of data a vendor payload key carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Intent,
    Int,
    DateTime,
}

impl DataType {
    pub fn as_str(&self) -> &str {
        match self {
            DataType::Intent => "intent",
            DataType::Int => "int",
            DataType::DateTime => "datetime",
        }
    }
}

impl FromStr for DataType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "intent" => Ok(DataType::Intent),
            "int" => Ok(DataType::Int),
            "datetime" => Ok(DataType::DateTime),
            other => Err(EngineError::Config(format!("Unknown NLU data type '{}'", other))),
        }
    }
}

/// Precision of a datetime value, as reported by the NLU service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }
}

impl FromStr for Granularity {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "second" => Ok(Granularity::Second),
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "year" => Ok(Granularity::Year),
            other => Err(EngineError::NluParse(format!("Unknown granularity '{}'", other))),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in time together with its precision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranularTime {
    pub value: DateTime<FixedOffset>,
    pub granularity: Granularity,
}

impl GranularTime {
    pub fn new(value: DateTime<FixedOffset>, granularity: Granularity) -> Self {
        Self { value, granularity }
    }
}

/// Payload of an entity. The `type` tag is what storage adapters key on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityValue {
    Integer {
        value: i64,
    },
    DateTime {
        value: DateTime<FixedOffset>,
        granularity: Granularity,
    },
    Interval {
        from: GranularTime,
        to: GranularTime,
    },
}

impl EntityValue {
    pub fn data_type(&self) -> DataType {
        match self {
            EntityValue::Integer { .. } => DataType::Int,
            EntityValue::DateTime { .. } | EntityValue::Interval { .. } => DataType::DateTime,
        }
    }
}

/// A piece of structured data extracted from an utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub confidence: f32,
    pub value: EntityValue,
}

impl Entity {
    pub fn integer(name: impl Into<String>, confidence: f32, value: i64) -> Self {
        Self {
            name: name.into(),
            confidence,
            value: EntityValue::Integer { value },
        }
    }

    pub fn datetime(
        name: impl Into<String>,
        confidence: f32,
        value: DateTime<FixedOffset>,
        granularity: Granularity,
    ) -> Self {
        Self {
            name: name.into(),
            confidence,
            value: EntityValue::DateTime { value, granularity },
        }
    }

    pub fn interval(
        name: impl Into<String>,
        confidence: f32,
        from: GranularTime,
        to: GranularTime,
    ) -> Self {
        Self {
            name: name.into(),
            confidence,
            value: EntityValue::Interval { from, to },
        }
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }

    /// Integer payload, if this entity carries one
    pub fn as_integer(&self) -> Option<i64> {
        match self.value {
            EntityValue::Integer { value } => Some(value),
            _ => None,
        }
    }
}

/// The classified purpose of an utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl Intent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// Intent and entities as understood by the NLU service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedData {
    #[serde(default)]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl ParsedData {
    pub fn new(intent: Option<Intent>, entities: Vec<Entity>) -> Self {
        Self { intent, entities }
    }

    pub fn intent_name(&self) -> Option<&str> {
        self.intent.as_ref().map(|i| i.name.as_str())
    }

    /// First entity with the given name, in payload order
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn has_entity(&self, name: &str) -> bool {
        self.entity(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.intent.is_none() && self.entities.is_empty()
    }
}

/// Turns a raw vendor payload into [`ParsedData`]
///
/// Implementations are stateless and synchronous.
pub trait NluParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<ParsedData, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_lookup_by_name() {
        let data = ParsedData::new(
            Some(Intent::new("book_table")),
            vec![Entity::integer("nb_persons", 0.9, 4)],
        );

        assert_eq!(data.intent_name(), Some("book_table"));
        assert!(data.has_entity("nb_persons"));
        assert!(!data.has_entity("booking_date"));
        assert_eq!(data.entity("nb_persons").and_then(Entity::as_integer), Some(4));
    }

    #[test]
    fn test_entity_value_keeps_its_shape_in_json() {
        let from = DateTime::parse_from_rfc3339("2026-10-17T19:00:00+02:00").unwrap();
        let to = DateTime::parse_from_rfc3339("2026-10-17T21:00:00+02:00").unwrap();
        let entity = Entity::interval(
            "booking_date",
            0.8,
            GranularTime::new(from, Granularity::Hour),
            GranularTime::new(to, Granularity::Hour),
        );

        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["value"]["type"], "interval");
        assert_eq!(json["value"]["from"]["granularity"], "hour");

        let back: Entity = serde_json::from_value(json).unwrap();
        assert_eq!(back, entity);
        assert_eq!(back.data_type(), DataType::DateTime);
    }

    #[test]
    fn test_data_type_parsing() {
        assert_eq!("int".parse::<DataType>().unwrap(), DataType::Int);
        assert_eq!("datetime".parse::<DataType>().unwrap(), DataType::DateTime);
        assert!("string".parse::<DataType>().is_err());
    }
}
