use std::future::Future;

use shared::error::{RemoteOperation, SessionError};
use tokio::task::JoinHandle;

enum Completion<T> {
    Ready(Result<T, SessionError>),
    Task(JoinHandle<Result<T, SessionError>>),
}

/// Outcome of an operation that was started but may not have completed.
/// Dropping it lets the operation finish in the background.
#[must_use = "await `wait` to observe the outcome, or drop to detach"]
pub struct PendingOperation<T = ()> {
    operation: RemoteOperation,
    completion: Completion<T>,
}

impl<T: Send + 'static> PendingOperation<T> {
    pub(crate) fn spawn<F>(operation: RemoteOperation, future: F) -> Self
    where
        F: Future<Output = Result<T, SessionError>> + Send + 'static,
    {
        Self {
            operation,
            completion: Completion::Task(tokio::spawn(future)),
        }
    }

    pub(crate) fn ready(operation: RemoteOperation, result: Result<T, SessionError>) -> Self {
        Self {
            operation,
            completion: Completion::Ready(result),
        }
    }

    pub fn operation(&self) -> RemoteOperation {
        self.operation
    }

    pub fn is_finished(&self) -> bool {
        match &self.completion {
            Completion::Ready(_) => true,
            Completion::Task(handle) => handle.is_finished(),
        }
    }

    pub async fn wait(self) -> Result<T, SessionError> {
        match self.completion {
            Completion::Ready(result) => result,
            Completion::Task(handle) => handle
                .await
                .map_err(|err| SessionError::remote(self.operation, err))?,
        }
    }
}
