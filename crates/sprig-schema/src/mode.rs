use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the engine transcript is echoed to the console. The log file always
/// receives every raw line regardless of mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One line per task plus a closing summary.
    #[default]
    Clean,
    /// Raw engine output, unmodified.
    Verbose,
    /// One JSON object per task event plus a summary object.
    Json,
}

impl OutputMode {
    pub const ALL: [OutputMode; 3] = [Self::Clean, Self::Verbose, Self::Json];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Verbose => "verbose",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputMode {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clean" => Ok(Self::Clean),
            "verbose" => Ok(Self::Verbose),
            "json" => Ok(Self::Json),
            _ => Err(SchemaError::UnknownMode(s.to_owned())),
        }
    }
}
