use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    #[serde(alias = "nodejs")]
    Javascript,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::Javascript => "cjs",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Self::Python),
            "javascript" | "js" | "nodejs" | "node" => Ok(Self::Javascript),
            other => Err(DomainError::UnsupportedLanguage(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxOutcome {
    /// The interpreter exited on its own. The exit code may still be non-zero.
    Completed,
    /// Killed after the wall-clock limit or a cancellation.
    TimedOut,
    /// Could not be launched, or died from a signal.
    Crashed,
}

impl SandboxOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Crashed => "crashed",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedStream {
    pub text: String,
    pub truncated: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxExecution {
    pub id: ExecutionId,
    pub language: Language,
    pub script_path: PathBuf,
    pub arena: PathBuf,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub outcome: SandboxOutcome,
}

impl SandboxExecution {
    pub fn succeeded(&self) -> bool {
        self.outcome == SandboxOutcome::Completed && self.exit_code == Some(0)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::Language;

    #[test]
    fn language_accepts_node_aliases() {
        assert_eq!("nodejs".parse::<Language>().ok(), Some(Language::Javascript));
        assert_eq!("JavaScript".parse::<Language>().ok(), Some(Language::Javascript));
        assert_eq!("python".parse::<Language>().ok(), Some(Language::Python));
        assert!("ruby".parse::<Language>().is_err());
    }

    #[test]
    fn language_deserializes_from_tool_arguments() {
        let parsed: Language = serde_json::from_str("\"nodejs\"").expect("alias");
        assert_eq!(parsed, Language::Javascript);
    }
}
