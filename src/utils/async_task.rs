use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::error;

use crate::Result;
use crate::TopoError;

/// Runs `task` under a deadline. Expiry surfaces as `TopoError::DeadlineExceeded`
/// naming `operation`.
pub(crate) async fn task_with_timeout<F, T>(
    operation: &str,
    deadline: Duration,
    task: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(deadline, task).await {
        Ok(result) => result,
        Err(_) => Err(TopoError::DeadlineExceeded {
            operation: operation.to_string(),
            timeout: deadline,
        }
        .into()),
    }
}

// Helper function to spawn tasks and track their JoinHandles
pub(crate) fn spawn_task<Fut>(
    name: &str,
    task: Fut,
    handles: Option<&mut Vec<JoinHandle<()>>>,
) where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}
