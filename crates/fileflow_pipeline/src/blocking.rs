//! Off-thread execution for blocking store and parse calls.
//!
//! File stores and record readers do synchronous I/O: an archive copy,
//! a streaming hash, or a batch parse can hold a thread for seconds.
//! Run inline they would pin a runtime worker per in-flight file, so
//! every such call site hops through `spawn_blocking`.

use std::panic;

pub(crate) async fn run_blocking<T, F>(task: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(value) => value,
        // Re-raise panics so the per-file isolation task records them
        // as a WorkerPanic.
        Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
        Err(e) => panic::panic_any(format!("blocking task lost: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_the_closure_value() {
        assert_eq!(run_blocking(|| 2 + 2).await, 4);
    }

    #[tokio::test]
    async fn panics_propagate_to_the_caller_task() {
        let handle = tokio::spawn(async {
            run_blocking(|| -> u32 { panic!("boom") }).await
        });
        assert!(handle.await.unwrap_err().is_panic());
    }
}
