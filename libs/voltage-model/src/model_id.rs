//! Model identifier recognition
//!
//! Full DTDL ids look like `dtmi:com:willowinc:ZoneAirTemperatureSensor;1`.
//! Rules may use the short form `ZoneAirTemperatureSensor;1`, which is
//! expanded with the default namespace.

use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_MODEL_NAMESPACE: &str = "dtmi:com:willowinc:";

static MODEL_ID: OnceLock<Option<Regex>> = OnceLock::new();

/// Whether an identifier names a model rather than a twin
pub fn is_model_id(text: &str) -> bool {
    MODEL_ID
        .get_or_init(|| {
            Regex::new(r"^(dtmi:[A-Za-z0-9_]+(:[A-Za-z0-9_]+)*|[A-Za-z][A-Za-z0-9_]*);[0-9]+$").ok()
        })
        .as_ref()
        .is_some_and(|re| re.is_match(text))
}

/// Expand a short model id into the default namespace
pub fn normalize_model_id(text: &str) -> String {
    if text.starts_with("dtmi:") {
        text.to_string()
    } else {
        format!("{DEFAULT_MODEL_NAMESPACE}{text}")
    }
}
