//! Rule definition type definitions
//!
//! Core types loaded from rule files:
//! - RuleDefinition: template, window, fields, impact scores and triggers
//! - Field: one named expression evaluated every tick
//! - RuleInstance: a rule applied to one subject twin
//! - RuleSet: a document holding rules and their instances

use crate::error::{Result, RuleError};
use chrono::TimeDelta;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Field holding the rule's output, the series every template reads
pub const RESULT_FIELD: &str = "result";

/// Longest history a rule buffer keeps
pub const MAX_BUFFER_DAYS: i64 = 365;

// ============================================================================
// Fields
// ============================================================================

/// How a field's computed value is written into its buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CumulativeMode {
    /// Buffer the value as computed
    #[default]
    Simple,
    /// Running sum of every value
    Accumulate,
    /// Running sum of value times seconds since the previous point
    AccumulateTimeSeconds,
    AccumulateTimeMinutes,
    AccumulateTimeHours,
}

impl CumulativeMode {
    /// Amount added to the running total, `None` for simple fields
    pub fn increment(&self, value: f64, gap: TimeDelta) -> Option<f64> {
        let seconds = gap.num_milliseconds() as f64 / 1000.0;
        match self {
            CumulativeMode::Simple => None,
            CumulativeMode::Accumulate => Some(value),
            CumulativeMode::AccumulateTimeSeconds => Some(value * seconds),
            CumulativeMode::AccumulateTimeMinutes => Some(value * seconds / 60.0),
            CumulativeMode::AccumulateTimeHours => Some(value * seconds / 3600.0),
        }
    }

    pub fn is_simple(&self) -> bool {
        matches!(self, CumulativeMode::Simple)
    }
}

/// A named expression evaluated every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Identifier, also the variable name other expressions use
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Expression text
    pub expression: String,

    /// Declared unit, overrides the unit the expression carries
    #[serde(default)]
    pub unit: Option<String>,

    #[serde(default)]
    pub cumulative: CumulativeMode,

    /// Whether computed values are kept in the field's buffer
    #[serde(default = "default_true")]
    pub buffered: bool,
}

impl Field {
    pub fn new(id: impl Into<String>, expression: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            expression: expression.into(),
            unit: None,
            cumulative: CumulativeMode::Simple,
            buffered: true,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_cumulative(mut self, mode: CumulativeMode) -> Self {
        self.cumulative = mode;
        self
    }

    pub fn unbuffered(mut self) -> Self {
        self.buffered = false;
        self
    }

    pub fn is_result(&self) -> bool {
        self.id == RESULT_FIELD
    }
}

/// Cost, comfort or reliability impact computed from the rule's statistic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactScore {
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub expression: String,

    #[serde(default)]
    pub unit: Option<String>,
}

impl ImpactScore {
    pub fn new(id: impl Into<String>, expression: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            expression: expression.into(),
            unit: None,
        }
    }
}

/// Command output: a condition and the value to command while it holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: String,
    pub condition: String,
    pub value: String,
}

/// User function available to every expression of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroDefinition {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    pub body: String,
}

// ============================================================================
// Templates
// ============================================================================

/// How the result series turns into a fault decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Template {
    /// Faulted when the result was true for at least `threshold` of the window
    Fault {
        #[serde(default = "default_fault_threshold")]
        threshold: f64,
        #[serde(default)]
        reset: Option<f64>,
    },

    /// Faulted when the area outside `[low, high]` over the window reaches `threshold`
    Limit {
        #[serde(default)]
        low: Option<f64>,
        #[serde(default)]
        high: Option<f64>,
        threshold: f64,
        #[serde(default)]
        reset: Option<f64>,
    },

    /// Faulted when the result rose more than `threshold` times in the window
    Frequency {
        threshold: f64,
        #[serde(default)]
        reset: Option<f64>,
        /// Declare the fault before the window is covered once the count is already over
        #[serde(default)]
        early_exit: bool,
    },

    /// Faulted when the result has not changed for `threshold_hours`
    StuckSensor { threshold_hours: f64 },

    /// No fault decision, the rule only produces calculated points
    Calculated,
}

impl Template {
    pub fn name(&self) -> &'static str {
        match self {
            Template::Fault { .. } => "fault",
            Template::Limit { .. } => "limit",
            Template::Frequency { .. } => "frequency",
            Template::StuckSensor { .. } => "stuck_sensor",
            Template::Calculated => "calculated",
        }
    }

    /// Variable the template's statistic is published under
    pub fn statistic_name(&self) -> Option<&'static str> {
        match self {
            Template::Fault { .. } => Some("PERCENTAGE_FAULTED"),
            Template::Limit { .. } => Some("AREA_OUTSIDE"),
            Template::Frequency { .. } => Some("COUNT"),
            Template::StuckSensor { .. } => Some("STUCK_HOURS"),
            Template::Calculated => None,
        }
    }

    /// Trigger and reset thresholds, reset defaults to the trigger threshold
    pub fn thresholds(&self) -> Option<(f64, f64)> {
        match self {
            Template::Fault { threshold, reset }
            | Template::Limit {
                threshold, reset, ..
            }
            | Template::Frequency {
                threshold, reset, ..
            } => Some((*threshold, reset.unwrap_or(*threshold))),
            Template::StuckSensor { threshold_hours } => Some((*threshold_hours, *threshold_hours)),
            Template::Calculated => None,
        }
    }

    /// Whether the window must be covered by history before a decision is made
    pub fn needs_full_window(&self) -> bool {
        matches!(
            self,
            Template::Fault { .. } | Template::Limit { .. } | Template::Frequency { .. }
        )
    }
}

// ============================================================================
// Rules and instances
// ============================================================================

/// A rule as authored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Unique identifier
    pub id: String,

    /// Rule name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Bumped on every edit, invalidates memoized bindings
    #[serde(default = "default_version")]
    pub version: u32,

    /// Whether the rule is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub template: Template,

    /// Trailing window the statistic is computed over
    #[serde(default = "default_window_hours")]
    pub window_hours: f64,

    /// Evaluated in order, later fields may read earlier ones
    pub fields: Vec<Field>,

    #[serde(default)]
    pub impact_scores: Vec<ImpactScore>,

    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,

    #[serde(default)]
    pub macros: Vec<MacroDefinition>,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

fn default_window_hours() -> f64 {
    24.0
}

fn default_fault_threshold() -> f64 {
    0.5
}

fn hours(value: f64) -> TimeDelta {
    TimeDelta::milliseconds((value * 3_600_000.0).round() as i64)
}

impl RuleDefinition {
    pub fn new(id: impl Into<String>, template: Template, fields: Vec<Field>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            version: default_version(),
            enabled: true,
            template,
            window_hours: default_window_hours(),
            fields,
            impact_scores: Vec::new(),
            triggers: Vec::new(),
            macros: Vec::new(),
        }
    }

    pub fn with_window_hours(mut self, window_hours: f64) -> Self {
        self.window_hours = window_hours;
        self
    }

    pub fn with_impact(mut self, score: ImpactScore) -> Self {
        self.impact_scores.push(score);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_macro(mut self, definition: MacroDefinition) -> Self {
        self.macros.push(definition);
        self
    }

    pub fn window(&self) -> TimeDelta {
        hours(self.window_hours)
    }

    /// History kept per rule buffer: twice the longest span the template reads, capped at a year
    pub fn retention(&self) -> TimeDelta {
        let span = match &self.template {
            Template::StuckSensor { threshold_hours } => self.window().max(hours(*threshold_hours)),
            _ => self.window(),
        };
        (span * 2).min(TimeDelta::days(MAX_BUFFER_DAYS))
    }

    pub fn result_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.is_result())
    }

    /// Structural checks that do not need the twin graph
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RuleError::invalid_definition("rule id is empty"));
        }
        if self.window_hours.is_nan() || self.window_hours <= 0.0 {
            return Err(RuleError::invalid_definition(format!(
                "{}: window must be positive, got {}h",
                self.id, self.window_hours
            )));
        }
        if self.result_field().is_none() {
            return Err(RuleError::invalid_definition(format!(
                "{}: no '{}' field",
                self.id, RESULT_FIELD
            )));
        }

        let mut seen = FxHashSet::default();
        let ids = self
            .fields
            .iter()
            .map(|f| f.id.as_str())
            .chain(self.impact_scores.iter().map(|s| s.id.as_str()))
            .chain(self.triggers.iter().map(|t| t.id.as_str()));
        for id in ids {
            if !seen.insert(id) {
                return Err(RuleError::invalid_definition(format!(
                    "{}: duplicate id '{}'",
                    self.id, id
                )));
            }
        }

        if let Template::Limit { low: None, high: None, .. } = self.template {
            return Err(RuleError::invalid_definition(format!(
                "{}: limit template needs a low or high limit",
                self.id
            )));
        }
        Ok(())
    }
}

/// A rule applied to one subject twin
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleInstance {
    pub id: String,
    pub rule_id: String,
    pub twin_id: String,
}

impl RuleInstance {
    pub fn new(rule_id: impl Into<String>, twin_id: impl Into<String>) -> Self {
        let (rule_id, twin_id) = (rule_id.into(), twin_id.into());
        Self {
            id: format!("{}_{}", twin_id, rule_id),
            rule_id,
            twin_id,
        }
    }
}

/// Rules and their instances as stored in a rules file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    #[serde(default)]
    pub instances: Vec<RuleInstance>,
}

impl RuleSet {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a `.json`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            other => Err(RuleError::Config(format!(
                "unsupported rules file extension: {:?}",
                other
            ))),
        }
    }

    /// Validate every rule and check each instance names a known rule
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            rule.validate()?;
        }
        for instance in &self.instances {
            if !self.rules.iter().any(|r| r.id == instance.rule_id) {
                return Err(RuleError::not_found(format!(
                    "rule {} for instance {}",
                    instance.rule_id, instance.id
                )));
            }
        }
        Ok(())
    }
}
