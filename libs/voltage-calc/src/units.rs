//! Unit table and unit-conversion rewrites
//!
//! Conversion pseudo-functions (`CELSIUS(x)`, `METRIC(x)`, ...) are resolved
//! at bind time: once the child's declared unit is known the call is
//! replaced by plain arithmetic tagged with the target unit.

use crate::ast::{BinaryOp, Expr};

const CFM_TO_LPS: f64 = 0.471_947_45;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Celsius,
    Fahrenheit,
    /// Fraction, 0..1
    Percentage,
    /// Percent, 0..100
    Percentage100,
    Cfm,
    LitersPerSecond,
}

impl Unit {
    pub fn parse(text: &str) -> Option<Self> {
        let unit = match text.trim() {
            "degC" | "°C" | "C" | "celsius" | "Celsius" => Unit::Celsius,
            "degF" | "°F" | "F" | "fahrenheit" | "Fahrenheit" => Unit::Fahrenheit,
            "%" => Unit::Percentage,
            "%100" => Unit::Percentage100,
            "cfm" | "CFM" => Unit::Cfm,
            "l/s" | "L/s" | "lps" | "LPS" => Unit::LitersPerSecond,
            _ => return None,
        };
        Some(unit)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Celsius => "degC",
            Unit::Fahrenheit => "degF",
            Unit::Percentage => "%",
            Unit::Percentage100 => "%100",
            Unit::Cfm => "cfm",
            Unit::LitersPerSecond => "l/s",
        }
    }
}

/// A unit-conversion pseudo-function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Celsius,
    Fahrenheit,
    Metric,
    Imperial,
    Percentage,
}

impl Conversion {
    /// Recognise a conversion by call name, common misspellings included
    pub fn from_name(name: &str) -> Option<Self> {
        let conversion = match name {
            "CELSIUS" | "CELCIUS" => Conversion::Celsius,
            "FAHRENHEIT" | "FARENHEIT" | "FARHENHEIT" => Conversion::Fahrenheit,
            "METRIC" => Conversion::Metric,
            "IMPERIAL" => Conversion::Imperial,
            "PERCENTAGE" | "PERCENT" => Conversion::Percentage,
            _ => return None,
        };
        Some(conversion)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Conversion::Celsius => "CELSIUS",
            Conversion::Fahrenheit => "FAHRENHEIT",
            Conversion::Metric => "METRIC",
            Conversion::Imperial => "IMPERIAL",
            Conversion::Percentage => "PERCENTAGE",
        }
    }

    /// Rewrite a bound child into the target unit
    ///
    /// A child without a recognised unit passes through unchanged, except
    /// for PERCENTAGE, which needs to know the scale it is reading.
    pub fn apply(&self, child: Expr) -> Result<Expr, String> {
        let unit = child.unit().and_then(Unit::parse);
        match (self, unit) {
            (Conversion::Celsius, Some(Unit::Fahrenheit)) => Ok(to_celsius(child)),
            (Conversion::Fahrenheit, Some(Unit::Celsius)) => Ok(to_fahrenheit(child)),
            (Conversion::Celsius | Conversion::Fahrenheit, _) => Ok(child),

            (Conversion::Metric, Some(Unit::Fahrenheit)) => Ok(to_celsius(child)),
            (Conversion::Metric, Some(Unit::Cfm)) => Ok(scale(child, CFM_TO_LPS, Unit::LitersPerSecond)),
            (Conversion::Metric, Some(u @ (Unit::Percentage | Unit::Percentage100))) => Err(
                format!("Cannot coerce {} to {}", u.symbol(), self.name()),
            ),
            (Conversion::Metric, _) => Ok(child),

            (Conversion::Imperial, Some(Unit::Celsius)) => Ok(to_fahrenheit(child)),
            (Conversion::Imperial, Some(Unit::LitersPerSecond)) => {
                Ok(scale(child, 1.0 / CFM_TO_LPS, Unit::Cfm))
            },
            (Conversion::Imperial, Some(u @ (Unit::Percentage | Unit::Percentage100))) => Err(
                format!("Cannot coerce {} to {}", u.symbol(), self.name()),
            ),
            (Conversion::Imperial, _) => Ok(child),

            (Conversion::Percentage, Some(Unit::Percentage)) => Ok(child),
            (Conversion::Percentage, Some(Unit::Percentage100)) => {
                Ok(scale(child, 0.01, Unit::Percentage))
            },
            (Conversion::Percentage, other) => Err(format!(
                "Cannot coerce {} to {}",
                other.map(|u| u.symbol()).or(child.unit()).unwrap_or("unitless value"),
                self.name()
            )),
        }
    }
}

fn scale(child: Expr, factor: f64, unit: Unit) -> Expr {
    Expr::binary(BinaryOp::Multiply, child, Expr::number(factor)).with_unit(unit.symbol())
}

fn to_celsius(child: Expr) -> Expr {
    let shifted = Expr::binary(BinaryOp::Subtract, child, Expr::number(32.0));
    let scaled = Expr::binary(BinaryOp::Multiply, shifted, Expr::number(5.0));
    Expr::binary(BinaryOp::Divide, scaled, Expr::number(9.0)).with_unit(Unit::Celsius.symbol())
}

fn to_fahrenheit(child: Expr) -> Expr {
    let scaled = Expr::binary(BinaryOp::Multiply, child, Expr::number(9.0));
    let ratio = Expr::binary(BinaryOp::Divide, scaled, Expr::number(5.0));
    Expr::binary(BinaryOp::Add, Expr::number(32.0), ratio).with_unit(Unit::Fahrenheit.symbol())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::ast::TwinRef;

    fn sensor(unit: &str) -> Expr {
        let mut twin = TwinRef::new("sensor-1", "dtmi:com:x:Sensor;1");
        twin.unit = Some(unit.to_string());
        Expr::Twin(twin)
    }

    #[test]
    fn test_fahrenheit_to_celsius() {
        let out = Conversion::Celsius.apply(sensor("degF")).unwrap();
        assert_eq!(out.to_string(), "(([sensor-1] - 32) * 5) / 9");
        assert_eq!(out.unit(), Some("degC"));
    }

    #[test]
    fn test_celsius_to_fahrenheit() {
        let out = Conversion::Fahrenheit.apply(sensor("degC")).unwrap();
        assert_eq!(out.to_string(), "32 + (([sensor-1] * 9) / 5)");
        assert_eq!(out.unit(), Some("degF"));
    }

    #[test]
    fn test_same_unit_passes_through() {
        let out = Conversion::Celsius.apply(sensor("degC")).unwrap();
        assert_eq!(out, sensor("degC"));
        let out = Conversion::Metric.apply(sensor("l/s")).unwrap();
        assert_eq!(out, sensor("l/s"));
    }

    #[test]
    fn test_metric_flow() {
        let out = Conversion::Metric.apply(sensor("cfm")).unwrap();
        assert_eq!(out.unit(), Some("l/s"));
    }

    #[test]
    fn test_metric_rejects_percentages() {
        let err = Conversion::Metric.apply(sensor("%")).unwrap_err();
        assert_eq!(err, "Cannot coerce % to METRIC");
    }

    #[test]
    fn test_percentage_scale() {
        let out = Conversion::Percentage.apply(sensor("%100")).unwrap();
        assert_eq!(out.unit(), Some("%"));
        assert!(Conversion::Percentage.apply(sensor("%")).is_ok());
        assert!(Conversion::Percentage.apply(sensor("degC")).is_err());
        assert!(Conversion::Percentage.apply(Expr::number(5.0)).is_err());
    }

    #[test]
    fn test_misspelled_names() {
        assert_eq!(Conversion::from_name("CELCIUS"), Some(Conversion::Celsius));
        assert_eq!(Conversion::from_name("FARHENHEIT"), Some(Conversion::Fahrenheit));
        assert_eq!(Conversion::from_name("ABS"), None);
    }
}
