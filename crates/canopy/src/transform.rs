//! Transform chains: declarative column extraction over raw records.
//!
//! A [`TransformChain`] is an ordered list of [`Step`]s. Each step consumes
//! the previous step's output and produces a new value. Every step is total:
//! absent or ill-shaped input becomes `null` and flows on to the next step,
//! so a chain degrades to a null column instead of aborting the row.

use serde_json::Value;

/// A single extraction step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Navigate a dotted path through objects and arrays.
    ///
    /// At an array, the remaining path is applied to every element and the
    /// results are flattened into one array. Missing keys yield `null`.
    GetField(String),
    /// Look up a key in an object. Missing key or non-object yields `null`.
    GetMapEntry(String),
    /// Index an array. Out of range or non-array yields `null`.
    GetElementAt(usize),
    /// Replace mapped values; unmapped values pass through unchanged.
    Remap(Vec<(Value, Value)>),
    /// Coerce numbers and numeric strings to an integer, anything else to `null`.
    ToInt,
    /// Trim surrounding whitespace from strings.
    Trim,
    /// Turn a zero or empty value into `null`.
    NilIfZero,
    /// Replace `null` with a default value.
    OrDefault(Value),
}

impl Step {
    pub fn get_field(path: impl Into<String>) -> Self {
        Step::GetField(path.into())
    }

    pub fn get_map_entry(key: impl Into<String>) -> Self {
        Step::GetMapEntry(key.into())
    }

    /// Build a remapping step from `(from, to)` pairs.
    pub fn remap<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        Step::Remap(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn or_default(value: impl Into<Value>) -> Self {
        Step::OrDefault(value.into())
    }

    /// Apply this step to an input value.
    pub fn apply(&self, input: &Value) -> Value {
        match self {
            Step::GetField(path) => {
                let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
                navigate(input, &segments)
            }
            Step::GetMapEntry(key) => match input {
                Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            },
            Step::GetElementAt(index) => match input {
                Value::Array(items) => items.get(*index).cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            },
            Step::Remap(table) => table
                .iter()
                .find(|(from, _)| from == input)
                .map(|(_, to)| to.clone())
                .unwrap_or_else(|| input.clone()),
            Step::ToInt => to_int(input).map(Value::from).unwrap_or(Value::Null),
            Step::Trim => match input {
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other.clone(),
            },
            Step::NilIfZero => {
                if is_zero(input) {
                    Value::Null
                } else {
                    input.clone()
                }
            }
            Step::OrDefault(default) => {
                if input.is_null() {
                    default.clone()
                } else {
                    input.clone()
                }
            }
        }
    }
}

fn navigate(value: &Value, segments: &[&str]) -> Value {
    let Some((head, rest)) = segments.split_first() else {
        return value.clone();
    };
    match value {
        Value::Object(map) => map
            .get(*head)
            .map(|child| navigate(child, rest))
            .unwrap_or(Value::Null),
        Value::Array(items) => {
            let mut flattened = Vec::new();
            for item in items {
                match navigate(item, segments) {
                    Value::Null => {}
                    Value::Array(nested) => flattened.extend(nested),
                    other => flattened.push(other),
                }
            }
            Value::Array(flattened)
        }
        _ => Value::Null,
    }
}

fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                    .map(|f| f.trunc() as i64)
            })
        }
        _ => None,
    }
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// An ordered sequence of [`Step`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformChain {
    steps: Vec<Step>,
}

impl TransformChain {
    /// An empty chain; applying it returns the input unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain starting with a [`Step::GetField`].
    pub fn path(path: impl Into<String>) -> Self {
        Self::new().then(Step::get_field(path))
    }

    /// Append a step.
    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order against `input`.
    pub fn apply(&self, input: &Value) -> Value {
        let Some((first, rest)) = self.steps.split_first() else {
            return input.clone();
        };
        rest.iter()
            .fold(first.apply(input), |current, step| step.apply(&current))
    }
}

impl FromIterator<Step> for TransformChain {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}
