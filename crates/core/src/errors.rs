use thiserror::Error;

use crate::workflow::WorkflowError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("validation failed: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<WorkflowError> for ApplicationError {
    fn from(value: WorkflowError) -> Self {
        Self::Domain(DomainError::Workflow(value))
    }
}

impl ApplicationError {
    /// Message safe to hand to API callers regardless of build profile.
    pub fn user_message(&self) -> String {
        match self {
            Self::Domain(error) => error.to_string(),
            Self::NotFound(what) => format!("{what} not found"),
            Self::Conflict(_) => {
                "The record was modified by another request. Reload and retry.".to_string()
            }
            Self::Persistence(_) => "An unexpected internal error occurred.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{ApplicationError, DomainError};
    use crate::workflow::{ApprovalStage, WorkflowError};

    #[test]
    fn workflow_errors_lift_into_the_domain_layer() {
        let error: ApplicationError =
            WorkflowError::StageAlreadyApproved { stage: ApprovalStage::Quality }.into();
        assert!(matches!(error, ApplicationError::Domain(DomainError::Workflow(_))));
        assert_eq!(error.to_string(), "stage `quality` is already approved");
    }

    #[test]
    fn domain_messages_are_user_safe_while_persistence_messages_are_not() {
        let domain: ApplicationError =
            DomainError::Validation("missing required field `partName`".to_string()).into();
        assert_eq!(domain.user_message(), "validation failed: missing required field `partName`");

        let persistence = ApplicationError::Persistence("disk I/O error at page 7".to_string());
        assert_eq!(persistence.user_message(), "An unexpected internal error occurred.");
    }

    #[test]
    fn conflict_message_tells_the_caller_to_retry() {
        let conflict = ApplicationError::Conflict("revision 3 expected, found 4".to_string());
        assert!(conflict.user_message().contains("retry"));
    }
}
