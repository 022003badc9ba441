use std::fmt;

use arbflow_helpers::redis::StreamsClientError;
use tokio::task::JoinError;

/// Provides a custom error type to be used for failures
/// in starting the coordinator.
#[derive(Debug)]
pub enum CoordinatorStartError {
    Environment(String),
    Broker(StreamsClientError),
    // An error occurred while blocking on one of the long-running
    // tasks to complete.
    TaskWaitError(JoinError),
}

impl fmt::Display for CoordinatorStartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CoordinatorStartError::Environment(env_error) => {
                write!(f, "coordinator start error: {env_error}")
            }
            CoordinatorStartError::Broker(client_error) => {
                write!(f, "coordinator start error: {client_error}")
            }
            CoordinatorStartError::TaskWaitError(join_error) => {
                write!(f, "coordinator start error: {join_error}")
            }
        }
    }
}

impl From<StreamsClientError> for CoordinatorStartError {
    fn from(error: StreamsClientError) -> Self {
        CoordinatorStartError::Broker(error)
    }
}

impl From<JoinError> for CoordinatorStartError {
    fn from(error: JoinError) -> Self {
        CoordinatorStartError::TaskWaitError(error)
    }
}
