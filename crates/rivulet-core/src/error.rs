use thiserror::Error;

/// Core error type for the Rivulet engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An operation was requested on a flow object or work item whose state does not allow it
    #[error("Unexpected state for activity {activity} while attempting to {operation}")]
    UnexpectedActivityState {
        /// Activity (or instance) the operation targeted
        activity: String,
        /// Operation that was attempted
        operation: String,
    },

    /// An operation targeted an activity that does not currently hold a token
    #[error("Unexpected activity {actual}, expected one of [{expected}]")]
    UnexpectedActivity {
        /// Activities currently holding tokens, comma separated
        expected: String,
        /// Activity the caller targeted
        actual: String,
    },

    /// The participant does not hold the role required by the activity
    #[error("Access denied: participant {participant} may not act on {activity}")]
    AccessDenied {
        /// Activity the participant tried to act on
        activity: String,
        /// Participant identifier
        participant: String,
    },

    /// No outgoing sequence flow could be selected
    #[error("No sequence flow could be selected from flow object {flow_object}")]
    SequenceFlowNotSelected {
        /// Flow object whose outgoing flows were evaluated
        flow_object: String,
    },

    /// Definition integrity failure or misuse of the engine
    #[error("Logic error: {0}")]
    Logic(String),

    /// Flow object not found
    #[error("Flow object not found: {0}")]
    FlowObjectNotFound(String),

    /// Process definition not found
    #[error("Process definition not found: {0}")]
    ProcessDefinitionNotFound(String),

    /// Process instance not found
    #[error("Process instance not found: {0}")]
    ProcessInstanceNotFound(String),

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Operation runner or data provider error
    #[error("Operation error: {0}")]
    OperationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::UnexpectedActivityState`]
    pub fn unexpected_state(activity: impl Into<String>, operation: impl Into<String>) -> Self {
        CoreError::UnexpectedActivityState {
            activity: activity.into(),
            operation: operation.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                CoreError::unexpected_state("task1", "allocate"),
                "Unexpected state for activity task1 while attempting to allocate",
            ),
            (
                CoreError::UnexpectedActivity {
                    expected: "task1, task2".to_string(),
                    actual: "task3".to_string(),
                },
                "Unexpected activity task3, expected one of [task1, task2]",
            ),
            (
                CoreError::AccessDenied {
                    activity: "task1".to_string(),
                    participant: "bob".to_string(),
                },
                "Access denied: participant bob may not act on task1",
            ),
            (
                CoreError::SequenceFlowNotSelected {
                    flow_object: "gw".to_string(),
                },
                "No sequence flow could be selected from flow object gw",
            ),
            (CoreError::Logic("bad".to_string()), "Logic error: bad"),
            (CoreError::FlowObjectNotFound("n".to_string()), "Flow object not found: n"),
            (
                CoreError::ProcessDefinitionNotFound("p".to_string()),
                "Process definition not found: p",
            ),
            (
                CoreError::ProcessInstanceNotFound("i".to_string()),
                "Process instance not found: i",
            ),
            (
                CoreError::ExpressionError("expr".to_string()),
                "Expression evaluation error: expr",
            ),
            (CoreError::OperationError("op".to_string()), "Operation error: op"),
            (
                CoreError::SerializationError("ser".to_string()),
                "Serialization error: ser",
            ),
            (CoreError::StateStoreError("db".to_string()), "State store error: db"),
            (CoreError::Other("other_err".to_string()), "other_err"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => {
                assert!(msg.contains("expected value"));
            }
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "test error message".into();
        assert_eq!(error, CoreError::Other("test error message".to_string()));
    }
}
