use std::future::Future;

use tokio::task::JoinHandle;

use crate::error::RunError;

/// A spawned task in flight.
///
/// Thin wrapper over the runtime's join handle. Domain failures travel
/// inside `T` as ordinary values; a [`RunError`] from [`TaskRun::join`]
/// means the task itself died (panic or cancellation), which aborts the
/// whole run rather than one branch.
pub struct TaskRun<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> TaskRun<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    pub async fn join(self) -> Result<T, RunError> {
        self.handle.await.map_err(RunError::from)
    }
}

/// Drains the pending buffer once it has grown to `max_len`.
///
/// Call after every submission. While the buffer is shorter than `max_len`
/// this returns immediately; once the threshold is reached, every buffered
/// run is awaited in submission order, passed through `insert`, and
/// appended to `results`, leaving the buffer empty. A final call with
/// `max_len` 0 flushes any remainder. Results are never reordered or
/// dropped.
///
/// This bounds both in-flight concurrency and the memory held by pending
/// handles, while still overlapping submission with completion.
pub async fn wait_for_runs<T, U, F>(
    results: &mut Vec<U>,
    buffer: &mut Vec<TaskRun<T>>,
    max_len: usize,
    mut insert: F,
) -> Result<(), RunError>
where
    T: Send + 'static,
    F: FnMut(T) -> U,
{
    if buffer.len() < max_len {
        return Ok(());
    }

    for run in buffer.drain(..) {
        results.push(insert(run.join().await?));
    }

    Ok(())
}
