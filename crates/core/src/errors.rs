use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::conversation::HistoryViolation;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    History(#[from] HistoryViolation),
    #[error("unsupported sandbox language `{0}`")]
    UnsupportedLanguage(String),
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("invalid kpi: {0}")]
    InvalidKpi(String),
    #[error("invalid context document: {0}")]
    InvalidContext(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Reasons a turn ends without a normal answer. These reach the observer
/// stream and the synthesized failure reply; tool failures never do.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TurnError {
    #[error("conversation history invariant violated: {0}")]
    HistoryInvariantViolation(String),
    #[error("iteration limit of {0} reached before a final answer")]
    IterationCapExceeded(u32),
    #[error("completion service failed: {0}")]
    CompletionService(String),
}

impl TurnError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::HistoryInvariantViolation(_) => "history_invariant_violation",
            Self::IterationCapExceeded(_) => "iteration_cap_exceeded",
            Self::CompletionService(_) => "completion_service",
        }
    }

    /// Text appended to the conversation as the assistant's reply for a failed turn.
    pub fn user_reply(&self) -> String {
        match self {
            Self::HistoryInvariantViolation(_) => "Something went wrong with the conversation \
                state, so it has been reset. Please ask your question again."
                .to_owned(),
            Self::IterationCapExceeded(limit) => format!(
                "I could not finish this request within {limit} steps. Try narrowing the \
                 question or splitting it into smaller parts."
            ),
            Self::CompletionService(_) => "The language model service is unavailable right \
                now. Please retry shortly."
                .to_owned(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let unassigned = || "unassigned".to_owned();
        match value {
            ApplicationError::Domain(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id: unassigned() }
            }
            ApplicationError::Turn(TurnError::IterationCapExceeded(limit)) => Self::BadRequest {
                message: format!("iteration limit {limit} reached"),
                correlation_id: unassigned(),
            },
            ApplicationError::Turn(TurnError::CompletionService(message))
            | ApplicationError::Persistence(message)
            | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: unassigned() }
            }
            ApplicationError::Turn(TurnError::HistoryInvariantViolation(message))
            | ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: unassigned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::conversation::{CallId, HistoryViolation};
    use crate::errors::{ApplicationError, DomainError, InterfaceError, TurnError};

    #[test]
    fn history_violation_maps_to_bad_request_with_correlation() {
        let interface = ApplicationError::from(DomainError::from(HistoryViolation::UnknownCall(
            CallId("call_1".to_owned()),
        )))
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn completion_failure_maps_to_service_unavailable() {
        let interface =
            ApplicationError::from(TurnError::CompletionService("HTTP 529 overloaded".to_owned()))
                .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface =
            ApplicationError::Configuration("missing api key".to_owned()).into_interface("req-3");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }

    #[test]
    fn cap_reply_names_the_limit() {
        let error = TurnError::IterationCapExceeded(3);
        assert_eq!(error.code(), "iteration_cap_exceeded");
        assert!(error.user_reply().contains("3 steps"));
    }
}
