use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LayerError;

/// A style property value as a host passes it, usually from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    Color([f32; 4]),
    Text(String),
}

impl PropertyValue {
    pub fn as_f64(&self, property: &str) -> Result<f64, LayerError> {
        match self {
            PropertyValue::Number(n) if n.is_finite() => Ok(*n),
            _ => Err(invalid(property, "a finite number")),
        }
    }

    pub fn as_u32(&self, property: &str) -> Result<u32, LayerError> {
        match self {
            PropertyValue::Number(n) if *n >= 0.0 && *n <= f64::from(u32::MAX) && n.fract() == 0.0 => {
                Ok(*n as u32)
            }
            _ => Err(invalid(property, "a non-negative integer")),
        }
    }

    pub fn as_bool(&self, property: &str) -> Result<bool, LayerError> {
        match self {
            PropertyValue::Bool(b) => Ok(*b),
            _ => Err(invalid(property, "a boolean")),
        }
    }

    /// RGBA in `0..=1`, from an array or a CSS hex / basic color name.
    pub fn as_color(&self, property: &str) -> Result<[f32; 4], LayerError> {
        let color = match self {
            PropertyValue::Color(c) => Some(*c),
            PropertyValue::Text(s) => parse_color(s),
            _ => None,
        };
        color
            .filter(|c| c.iter().all(|v| (0.0..=1.0).contains(v)))
            .ok_or_else(|| invalid(property, "a color"))
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Number(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_string())
    }
}

fn invalid(property: &str, expected: &'static str) -> LayerError {
    LayerError::InvalidValue {
        property: property.to_string(),
        expected,
    }
}

pub fn parse_color(s: &str) -> Option<[f32; 4]> {
    match s.trim().to_ascii_lowercase().as_str() {
        "white" => return Some([1.0; 4]),
        "black" => return Some([0.0, 0.0, 0.0, 1.0]),
        "transparent" => return Some([0.0; 4]),
        _ => {}
    }
    let hex = s.trim().strip_prefix('#')?;
    if !hex.is_ascii() {
        return None;
    }
    let digits: Vec<u8> = match hex.len() {
        3 | 4 => hex
            .chars()
            .map(|c| c.to_digit(16).map(|d| (d * 17) as u8))
            .collect::<Option<_>>()?,
        6 | 8 => (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
            .collect::<Option<_>>()?,
        _ => return None,
    };
    let channel = |i: usize| digits.get(i).map_or(1.0, |v| f32::from(*v) / 255.0);
    Some([channel(0), channel(1), channel(2), channel(3)])
}

pub type Setter<L> = fn(&mut L, &PropertyValue) -> Result<(), LayerError>;

/// Property name to setter, built once per layer type.
pub struct PropertyTable<L> {
    setters: BTreeMap<&'static str, Setter<L>>,
}

impl<L> PropertyTable<L> {
    pub fn new() -> Self {
        Self {
            setters: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &'static str, setter: Setter<L>) -> Self {
        self.setters.insert(name, setter);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.setters.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.setters.keys().copied()
    }

    pub fn apply(&self, layer: &mut L, name: &str, value: &PropertyValue) -> Result<(), LayerError> {
        let setter = self
            .setters
            .get(name)
            .ok_or_else(|| LayerError::UnknownProperty(name.to_string()))?;
        setter(layer, value)
    }
}

impl<L> Default for PropertyTable<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{PropertyTable, PropertyValue, parse_color};
    use crate::error::LayerError;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Probe {
        width: f64,
    }

    fn set_width(p: &mut Probe, v: &PropertyValue) -> Result<(), LayerError> {
        p.width = v.as_f64("line-width")?;
        Ok(())
    }

    #[test]
    fn table_dispatches_by_name() {
        let table: PropertyTable<Probe> = PropertyTable::new().with("line-width", set_width);
        let mut probe = Probe::default();
        table
            .apply(&mut probe, "line-width", &PropertyValue::Number(3.0))
            .unwrap();
        assert_eq!(probe.width, 3.0);
        assert_eq!(
            table.apply(&mut probe, "line-color", &PropertyValue::Number(1.0)),
            Err(LayerError::UnknownProperty("line-color".into()))
        );
        assert_eq!(
            table.apply(&mut probe, "line-width", &PropertyValue::Bool(true)),
            Err(LayerError::InvalidValue {
                property: "line-width".into(),
                expected: "a finite number"
            })
        );
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["line-width"]);
    }

    #[test]
    fn colors_parse_from_hex_and_names() {
        assert_eq!(parse_color("white"), Some([1.0; 4]));
        assert_eq!(parse_color("#f00"), Some([1.0, 0.0, 0.0, 1.0]));
        assert_eq!(parse_color("#00ff0080"), Some([0.0, 1.0, 0.0, 128.0 / 255.0]));
        assert_eq!(parse_color("#12"), None);
        assert_eq!(parse_color("teal"), None);
    }

    #[test]
    fn json_values_pick_the_right_variant() {
        let values: Vec<PropertyValue> =
            serde_json::from_str(r##"[true, 2.5, [1, 0.5, 0, 1], "#fff"]"##).unwrap();
        assert_eq!(
            values,
            vec![
                PropertyValue::Bool(true),
                PropertyValue::Number(2.5),
                PropertyValue::Color([1.0, 0.5, 0.0, 1.0]),
                PropertyValue::Text("#fff".into()),
            ]
        );
        assert_eq!(values[3].as_color("c").unwrap(), [1.0; 4]);
        assert!(PropertyValue::Number(1.5).as_u32("n").is_err());
        assert_eq!(PropertyValue::Number(7.0).as_u32("n").unwrap(), 7);
    }
}
