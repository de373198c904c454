//! Typed registry of the optimizer's command-line parameters.
//!
//! Deployments declare which parameters a job may set, their kind, default
//! and bounds. The registry is resolved once at startup from configuration;
//! jobs then carry a [`JobParameters`] map validated against it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use thiserror::Error;

/// Parameter names the orchestrator owns and users may never set.
pub const RESERVED_PARAMETERS: [&str; 2] = ["threads", "verbose"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Int,
    Float,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            ParamValue::Int(v) => *v as f64,
            ParamValue::Float(v) => *v,
        }
    }

    /// Convert to the requested kind. Floats only narrow to ints when integral.
    fn coerce(self, kind: ParamKind) -> Option<ParamValue> {
        match (self, kind) {
            (ParamValue::Int(v), ParamKind::Int) => Some(ParamValue::Int(v)),
            (ParamValue::Int(v), ParamKind::Float) => Some(ParamValue::Float(v as f64)),
            (ParamValue::Float(v), ParamKind::Float) => Some(ParamValue::Float(v)),
            (ParamValue::Float(v), ParamKind::Int) if v.fract() == 0.0 => {
                Some(ParamValue::Int(v as i64))
            }
            (ParamValue::Float(_), ParamKind::Int) => None,
        }
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Declaration of one parameter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamSpec {
    pub kind: ParamKind,
    pub default: ParamValue,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ParamSpec {
    pub fn int(default: i64) -> Self {
        Self {
            kind: ParamKind::Int,
            default: ParamValue::Int(default),
            min: None,
            max: None,
            description: None,
        }
    }

    pub fn float(default: f64) -> Self {
        Self {
            kind: ParamKind::Float,
            default: ParamValue::Float(default),
            min: None,
            max: None,
            description: None,
        }
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn in_bounds(&self, value: &ParamValue) -> bool {
        let v = value.as_f64();
        self.min.is_none_or(|min| v >= min) && self.max.is_none_or(|max| v <= max)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("unknown parameter: {0}")]
    Unknown(String),
    #[error("parameter {0} is managed by the orchestrator")]
    Reserved(String),
    #[error("parameter {name}: cannot read {raw:?} as {kind:?}")]
    InvalidValue {
        name: String,
        raw: String,
        kind: ParamKind,
    },
    #[error("parameter {name}: {value} is outside the allowed range")]
    OutOfRange { name: String, value: String },
}

/// Name -> declaration map, ordered by name.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterRegistry {
    specs: BTreeMap<String, ParamSpec>,
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::new()
            .with(
                "runs",
                ParamSpec::int(20)
                    .with_min(1.0)
                    .with_description("Number of independent optimization runs"),
            )
            .with(
                "restarts",
                ParamSpec::int(20)
                    .with_min(1.0)
                    .with_description("Restarts per run before giving up on a local optimum"),
            )
    }
}

impl ParameterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            specs: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.specs.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.get(name)
    }

    pub fn default_of(&self, name: &str) -> Option<ParamValue> {
        self.specs.get(name).map(|spec| spec.default)
    }

    /// Parameters a user may set, i.e. everything except the reserved names.
    pub fn user_settable(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.specs
            .iter()
            .filter(|(name, _)| !RESERVED_PARAMETERS.contains(&name.as_str()))
            .map(|(name, spec)| (name.as_str(), spec))
    }

    /// Validate raw user input and fill in defaults for anything omitted.
    pub fn resolve<I, K, V>(&self, pairs: I) -> Result<JobParameters, ParamError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut values = BTreeMap::new();

        for (name, raw) in pairs {
            let name = name.into();
            if RESERVED_PARAMETERS.contains(&name.as_str()) {
                return Err(ParamError::Reserved(name));
            }
            let spec = self
                .specs
                .get(&name)
                .ok_or_else(|| ParamError::Unknown(name.clone()))?;
            let value = parse_value(&name, raw.as_ref(), spec.kind)?;
            if !spec.in_bounds(&value) {
                return Err(ParamError::OutOfRange {
                    name,
                    value: value.to_string(),
                });
            }
            values.insert(name, value);
        }

        for (name, spec) in self.user_settable() {
            values.entry(name.to_string()).or_insert(spec.default);
        }

        Ok(JobParameters(values))
    }
}

fn parse_value(name: &str, raw: &str, kind: ParamKind) -> Result<ParamValue, ParamError> {
    let raw = raw.trim();
    let invalid = || ParamError::InvalidValue {
        name: name.to_string(),
        raw: raw.to_string(),
        kind,
    };
    let parsed = match raw.parse::<i64>() {
        Ok(v) => ParamValue::Int(v),
        Err(_) => ParamValue::Float(raw.parse::<f64>().map_err(|_| invalid())?),
    };
    parsed.coerce(kind).ok_or_else(invalid)
}

/// A job's resolved parameter set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(BTreeMap<String, ParamValue>);

impl JobParameters {
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.0.get(name).copied()
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.0.get(name)? {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) => Some(*v as i64),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as `--name=value` flags for the optimizer binary.
    pub fn command_flags(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(name, value)| format!("--{name}={value}"))
            .collect()
    }
}
