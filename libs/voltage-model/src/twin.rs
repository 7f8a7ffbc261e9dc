//! Twins and typed relations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A node in the asset graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    pub id: String,
    pub model_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Unit of the telemetry a capability produces
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// External signal id, defaults to the twin id
    #[serde(default)]
    pub trend_id: Option<String>,
    /// Expected reporting interval in seconds
    #[serde(default)]
    pub trend_interval_secs: Option<u64>,
    /// Physically plausible value range
    #[serde(default)]
    pub valid_range: Option<(f64, f64)>,
}

impl Twin {
    pub fn new(id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model_id: model_id.into(),
            name: None,
            unit: None,
            tags: Vec::new(),
            properties: BTreeMap::new(),
            trend_id: None,
            trend_interval_secs: None,
            valid_range: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_trend_id(mut self, trend_id: impl Into<String>) -> Self {
        self.trend_id = Some(trend_id.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn signal_id(&self) -> &str {
        self.trend_id.as_deref().unwrap_or(&self.id)
    }

    /// True when the twin carries telemetry
    pub fn has_signal(&self) -> bool {
        self.trend_id.is_some()
    }

    /// Every queried tag is present, case-insensitive and order-independent
    pub fn has_all_tags<S: AsRef<str>>(&self, query: &[S]) -> bool {
        !query.is_empty()
            && query.iter().all(|q| {
                self.tags
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(q.as_ref()))
            })
    }

    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name).or_else(|| {
            self.properties
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }
}

impl fmt::Display for Twin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.model_id)
    }
}

/// Relation kinds between twins
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationKind {
    IsCapabilityOf,
    IsPartOf,
    LocatedIn,
    IsFedBy,
    Feeds,
    HostedBy,
    ServedBy,
    Custom(String),
}

impl RelationKind {
    pub fn name(&self) -> &str {
        match self {
            RelationKind::IsCapabilityOf => "isCapabilityOf",
            RelationKind::IsPartOf => "isPartOf",
            RelationKind::LocatedIn => "locatedIn",
            RelationKind::IsFedBy => "isFedBy",
            RelationKind::Feeds => "feeds",
            RelationKind::HostedBy => "hostedBy",
            RelationKind::ServedBy => "servedBy",
            RelationKind::Custom(name) => name,
        }
    }

    /// `feeds` points away from the twin it belongs to
    pub fn is_forward(&self) -> bool {
        matches!(self, RelationKind::Feeds)
    }
}

impl From<String> for RelationKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "isCapabilityOf" => RelationKind::IsCapabilityOf,
            "isPartOf" => RelationKind::IsPartOf,
            "locatedIn" => RelationKind::LocatedIn,
            "isFedBy" => RelationKind::IsFedBy,
            "feeds" => RelationKind::Feeds,
            "hostedBy" => RelationKind::HostedBy,
            "servedBy" => RelationKind::ServedBy,
            _ => RelationKind::Custom(name),
        }
    }
}

impl From<&str> for RelationKind {
    fn from(name: &str) -> Self {
        RelationKind::from(name.to_string())
    }
}

impl From<RelationKind> for String {
    fn from(kind: RelationKind) -> Self {
        kind.name().to_string()
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Directed edge between two twins, by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
}

impl Relation {
    pub fn new(
        source: impl Into<String>,
        kind: impl Into<RelationKind>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: kind.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_relation_kind_names_round_trip_through_serde() {
        let relation = Relation::new("s1", "isCapabilityOf", "ahu-1");
        let json = serde_json::to_string(&relation).unwrap();
        assert!(json.contains("\"isCapabilityOf\""));
        let back: Relation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, RelationKind::IsCapabilityOf);

        let custom: RelationKind = "controls".into();
        assert_eq!(custom, RelationKind::Custom("controls".to_string()));
        assert_eq!(custom.name(), "controls");
    }

    #[test]
    fn test_tag_subset_match() {
        let twin = Twin::new("pt-1", "dtmi:com:x:Sensor;1").with_tags(["zone", "air", "temp", "sensor"]);
        assert!(twin.has_all_tags(&["temp", "ZONE"]));
        assert!(!twin.has_all_tags(&["temp", "water"]));
        assert!(!twin.has_all_tags::<&str>(&[]));
    }

    #[test]
    fn test_twin_defaults_from_json() {
        let twin: Twin =
            serde_json::from_str(r#"{"id": "ahu-1", "model_id": "dtmi:com:x:AirHandlingUnit;1"}"#)
                .unwrap();
        assert_eq!(twin.display_name(), "ahu-1");
        assert_eq!(twin.signal_id(), "ahu-1");
        assert!(!twin.has_signal());
    }
}
