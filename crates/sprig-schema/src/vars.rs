use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Flag the playbook engine uses to inject one variable document.
pub const EXTRA_VAR_FLAG: &str = "-e";

/// A single playbook variable. The variant is carried through to the engine
/// so `true` stays a boolean and `3` stays a number inside conditionals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl VarValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for VarValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for VarValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for VarValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for VarValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for VarValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// The resolved configuration map handed to a run. Ordered so that the
/// generated engine arguments are stable between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarMap(BTreeMap<String, VarValue>);

impl VarMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a flat TOML table of scalar values.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SchemaError> {
        let table: toml::Table = toml::from_str(content)?;
        let mut vars = Self::new();
        for (key, value) in table {
            let value = match value {
                toml::Value::Boolean(b) => VarValue::Bool(b),
                toml::Value::Integer(i) => VarValue::Integer(i),
                toml::Value::Float(x) => VarValue::Float(x),
                toml::Value::String(s) => VarValue::String(s),
                other => {
                    return Err(SchemaError::UnsupportedValue {
                        key,
                        kind: other.type_str().to_owned(),
                    })
                }
            };
            vars.insert(key, value);
        }
        Ok(vars)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<VarValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&VarValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(VarValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VarValue)> {
        self.0.iter()
    }

    /// Render every variable as an `-e <json>` token pair.
    pub fn to_extra_args(&self) -> Result<Vec<String>, SchemaError> {
        let mut args = Vec::with_capacity(self.0.len() * 2);
        for (key, value) in &self.0 {
            args.push(EXTRA_VAR_FLAG.to_owned());
            args.push(extra_var_token(key, value)?);
        }
        Ok(args)
    }

    /// Rebuild a map from `-e <json>` token pairs. Arguments that are not
    /// part of a pair are ignored.
    pub fn from_extra_args(args: &[String]) -> Result<Self, SchemaError> {
        let mut vars = Self::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg != EXTRA_VAR_FLAG {
                continue;
            }
            let token = iter
                .next()
                .ok_or_else(|| SchemaError::InvalidExtraVar("dangling -e flag".to_owned()))?;
            for (key, value) in parse_extra_var(token)? {
                vars.insert(key, value);
            }
        }
        Ok(vars)
    }
}

impl FromIterator<(String, VarValue)> for VarMap {
    fn from_iter<I: IntoIterator<Item = (String, VarValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn is_valid_var_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Serialize one variable as a single-key JSON document, e.g. `{"GPU_NODE":true}`.
pub fn extra_var_token(key: &str, value: &VarValue) -> Result<String, SchemaError> {
    if !is_valid_var_name(key) {
        return Err(SchemaError::InvalidVarName(key.to_owned()));
    }
    if let VarValue::Float(x) = value {
        if !x.is_finite() {
            return Err(SchemaError::UnsupportedValue {
                key: key.to_owned(),
                kind: format!("non-finite {}", value.kind()),
            });
        }
    }
    let mut doc = serde_json::Map::new();
    doc.insert(key.to_owned(), serde_json::to_value(value)?);
    Ok(serde_json::Value::Object(doc).to_string())
}

/// Parse a JSON variable document produced by [`extra_var_token`].
pub fn parse_extra_var(token: &str) -> Result<Vec<(String, VarValue)>, SchemaError> {
    let doc: BTreeMap<String, VarValue> = serde_json::from_str(token)
        .map_err(|e| SchemaError::InvalidExtraVar(format!("{token}: {e}")))?;
    Ok(doc.into_iter().collect())
}
