use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// Upper bound on one document body, in characters.
pub const MAX_CONTEXT_CHARS: usize = 100_000;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub String);

impl ContextId {
    pub fn generate() -> Self {
        Self(format!("ctx_{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Analyst-supplied reference text (team conventions, account maps, budget notes)
/// that a turn can pull into its system prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub id: ContextId,
    pub name: String,
    pub description: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContextDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
}

impl NewContextDocument {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidContext("context name must not be empty".into()));
        }
        if self.content.trim().is_empty() {
            return Err(DomainError::InvalidContext("context content must not be empty".into()));
        }
        let chars = self.content.chars().count();
        if chars > MAX_CONTEXT_CHARS {
            return Err(DomainError::InvalidContext(format!(
                "context content is {chars} characters; the limit is {MAX_CONTEXT_CHARS}"
            )));
        }
        Ok(())
    }

    pub fn into_document(self, id: ContextId, now: DateTime<Utc>) -> ContextDocument {
        ContextDocument {
            id,
            name: self.name.trim().to_string(),
            description: self.description.trim().to_string(),
            content: self.content,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{ContextId, NewContextDocument, MAX_CONTEXT_CHARS};

    fn document(content: String) -> NewContextDocument {
        NewContextDocument {
            name: " Account map ".to_string(),
            description: String::new(),
            content,
        }
    }

    #[test]
    fn blank_and_oversized_documents_are_rejected() {
        assert!(document("   ".to_string()).validate().is_err());
        assert!(document("x".repeat(MAX_CONTEXT_CHARS + 1)).validate().is_err());
        assert!(document("123456789012 = prod".to_string()).validate().is_ok());

        let mut unnamed = document("prod".to_string());
        unnamed.name = " ".to_string();
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn names_are_trimmed_and_ids_prefixed() {
        let id = ContextId::generate();
        assert!(id.0.starts_with("ctx_"));

        let stored = document("prod".to_string()).into_document(id.clone(), Utc::now());
        assert_eq!(stored.name, "Account map");
        assert_eq!(stored.id, id);
    }
}
