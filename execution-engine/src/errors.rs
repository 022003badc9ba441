use std::fmt;

use arbflow_helpers::redis::StreamsClientError;
use tokio::task::JoinError;

/// Provides a custom error type to be used for failures
/// in starting the execution engine.
#[derive(Debug)]
pub enum ExecutionEngineStartError {
    Environment(String),
    Broker(StreamsClientError),
    TaskWaitError(JoinError),
}

impl fmt::Display for ExecutionEngineStartError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionEngineStartError::Environment(env_error) => {
                write!(f, "execution engine start error: {env_error}")
            }
            ExecutionEngineStartError::Broker(client_error) => {
                write!(f, "execution engine start error: {client_error}")
            }
            ExecutionEngineStartError::TaskWaitError(join_error) => {
                write!(f, "execution engine start error: {join_error}")
            }
        }
    }
}

impl From<StreamsClientError> for ExecutionEngineStartError {
    fn from(error: StreamsClientError) -> Self {
        ExecutionEngineStartError::Broker(error)
    }
}

impl From<JoinError> for ExecutionEngineStartError {
    fn from(error: JoinError) -> Self {
        ExecutionEngineStartError::TaskWaitError(error)
    }
}

/// Provides a custom error type to be used for failures
/// within execution strategies.
#[derive(Debug)]
pub struct ExecutionError {
    message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        ExecutionError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "execution failed: {}", self.message)
    }
}

impl std::error::Error for ExecutionError {}
