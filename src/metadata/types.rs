use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::value::Value;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeParseError {
    #[error("invalid type '{0}' (unknown type)")]
    UnknownType(String),

    #[error("invalid type '{0}' (bad args)")]
    BadArgs(String),

    #[error("invalid type '{0}' (unexpected args)")]
    UnexpectedArgs(String),

    #[error("invalid type '{0}' (min >= max)")]
    EmptyRange(String),

    #[error("invalid type '{0}' (duplicate enum value)")]
    DuplicateEnumValue(String),
}

/// Declared type of a plugin member.
///
/// Textual forms: `range[min;max]`, `text`, `float`, `bool`, `enum{a,b,...}`,
/// `complex`. Equality is structural; enum values compare as sets.
#[derive(Debug, Clone)]
pub enum ValueType {
    Range { min: i64, max: i64 },
    Text,
    Float,
    Bool,
    Enum(Vec<String>),
    Complex,
}

impl ValueType {
    pub fn range(min: i64, max: i64) -> Result<Self, TypeParseError> {
        if min >= max {
            return Err(TypeParseError::EmptyRange(format!("range[{};{}]", min, max)));
        }
        Ok(ValueType::Range { min, max })
    }

    pub fn enumeration<I, S>(values: I) -> Result<Self, TypeParseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let printed = format!("enum{{{}}}", values.join(","));

        if values.len() < 2 || values.iter().any(|v| v.is_empty()) {
            return Err(TypeParseError::BadArgs(printed));
        }

        let uniques: HashSet<&String> = values.iter().collect();
        if uniques.len() != values.len() {
            return Err(TypeParseError::DuplicateEnumValue(printed));
        }

        Ok(ValueType::Enum(values))
    }

    /// Checks that `value` is acceptable for this type.
    pub fn validate(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueType::Range { min, max }, Value::Int(v)) => v >= min && v <= max,
            (ValueType::Text, Value::Text(_)) => true,
            (ValueType::Float, Value::Float(_)) => true,
            (ValueType::Bool, Value::Bool(_)) => true,
            (ValueType::Enum(values), Value::Text(v)) => values.contains(v),
            (ValueType::Complex, _) => true,
            _ => false,
        }
    }
}

impl PartialEq for ValueType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                ValueType::Range { min, max },
                ValueType::Range {
                    min: other_min,
                    max: other_max,
                },
            ) => min == other_min && max == other_max,
            (ValueType::Text, ValueType::Text) => true,
            (ValueType::Float, ValueType::Float) => true,
            (ValueType::Bool, ValueType::Bool) => true,
            (ValueType::Enum(values), ValueType::Enum(other_values)) => {
                let left: HashSet<&String> = values.iter().collect();
                let right: HashSet<&String> = other_values.iter().collect();
                values.len() == other_values.len() && left == right
            }
            (ValueType::Complex, ValueType::Complex) => true,
            _ => false,
        }
    }
}

impl Eq for ValueType {}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValueType::Range { min, max } => write!(f, "range[{};{}]", min, max),
            ValueType::Text => write!(f, "text"),
            ValueType::Float => write!(f, "float"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Enum(values) => write!(f, "enum{{{}}}", values.join(",")),
            ValueType::Complex => write!(f, "complex"),
        }
    }
}

impl FromStr for ValueType {
    type Err = TypeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let split = value
            .find(|c: char| !c.is_ascii_lowercase())
            .unwrap_or(value.len());
        let (base, args) = value.split_at(split);

        match base {
            "range" => {
                let inner = args
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .ok_or_else(|| TypeParseError::BadArgs(value.to_string()))?;

                let (min, max) = inner
                    .split_once(';')
                    .ok_or_else(|| TypeParseError::BadArgs(value.to_string()))?;

                let min: i64 = min
                    .parse()
                    .map_err(|_| TypeParseError::BadArgs(value.to_string()))?;
                let max: i64 = max
                    .parse()
                    .map_err(|_| TypeParseError::BadArgs(value.to_string()))?;

                if min >= max {
                    return Err(TypeParseError::EmptyRange(value.to_string()));
                }

                Ok(ValueType::Range { min, max })
            }
            "enum" => {
                let inner = args
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                    .ok_or_else(|| TypeParseError::BadArgs(value.to_string()))?;

                let valid = inner
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ',');
                if !valid {
                    return Err(TypeParseError::BadArgs(value.to_string()));
                }

                ValueType::enumeration(inner.split(','))
            }
            "text" | "float" | "bool" | "complex" => {
                if !args.is_empty() {
                    return Err(TypeParseError::UnexpectedArgs(value.to_string()));
                }

                Ok(match base {
                    "text" => ValueType::Text,
                    "float" => ValueType::Float,
                    "bool" => ValueType::Bool,
                    _ => ValueType::Complex,
                })
            }
            _ => Err(TypeParseError::UnknownType(value.to_string())),
        }
    }
}

impl TryFrom<String> for ValueType {
    type Error = TypeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ValueType> for String {
    fn from(value: ValueType) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_grammar() {
        assert_eq!(
            "range[-10;250]".parse::<ValueType>(),
            Ok(ValueType::Range { min: -10, max: 250 })
        );
        assert_eq!("text".parse::<ValueType>(), Ok(ValueType::Text));
        assert_eq!("float".parse::<ValueType>(), Ok(ValueType::Float));
        assert_eq!("bool".parse::<ValueType>(), Ok(ValueType::Bool));
        assert_eq!("complex".parse::<ValueType>(), Ok(ValueType::Complex));
        assert_eq!(
            "enum{off,heat,cool}".parse::<ValueType>(),
            Ok(ValueType::Enum(vec!["off".into(), "heat".into(), "cool".into()]))
        );
    }

    #[test]
    fn rejects_malformed_types() {
        assert!(matches!(
            "range[5;5]".parse::<ValueType>(),
            Err(TypeParseError::EmptyRange(_))
        ));
        assert!(matches!(
            "range[a;5]".parse::<ValueType>(),
            Err(TypeParseError::BadArgs(_))
        ));
        assert!(matches!(
            "bool[1]".parse::<ValueType>(),
            Err(TypeParseError::UnexpectedArgs(_))
        ));
        assert!(matches!(
            "enum{single}".parse::<ValueType>(),
            Err(TypeParseError::BadArgs(_))
        ));
        assert!(matches!(
            "enum{a,a}".parse::<ValueType>(),
            Err(TypeParseError::DuplicateEnumValue(_))
        ));
        assert!(matches!(
            "integer".parse::<ValueType>(),
            Err(TypeParseError::UnknownType(_))
        ));
    }

    #[test]
    fn display_matches_grammar() {
        for text in ["range[0;100]", "text", "float", "bool", "enum{a,b}", "complex"] {
            let typ: ValueType = text.parse().unwrap();
            assert_eq!(typ.to_string(), text);
        }
    }

    #[test]
    fn equality_is_structural() {
        let a: ValueType = "enum{a,b,c}".parse().unwrap();
        let b: ValueType = "enum{c,a,b}".parse().unwrap();
        let c: ValueType = "enum{a,b}".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        assert_eq!(ValueType::range(0, 10).unwrap(), ValueType::range(0, 10).unwrap());
        assert_ne!(ValueType::range(0, 10).unwrap(), ValueType::range(0, 11).unwrap());
        assert_ne!(ValueType::Text, ValueType::Float);
    }

    #[test]
    fn validates_values() {
        let range = ValueType::range(0, 100).unwrap();
        assert!(range.validate(&Value::Int(50)));
        assert!(!range.validate(&Value::Int(101)));
        assert!(!range.validate(&Value::Float(50.0)));

        let mode: ValueType = "enum{on,off}".parse().unwrap();
        assert!(mode.validate(&Value::Text("on".into())));
        assert!(!mode.validate(&Value::Text("auto".into())));
    }
}
