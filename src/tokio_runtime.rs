//! Global Tokio runtime for waiting on published state and off-thread work
//!
//! The engine itself is thread based; this runtime hosts `watch` waits in the
//! command line front end and runs analysis on the blocking pool.

use std::future::Future;
use std::sync::OnceLock;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

static TOKIO_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> &'static Runtime {
    TOKIO_RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("avycal-tokio")
            .enable_all()
            .build()
            .expect("Failed to create Tokio runtime")
    })
}

/// Get the global Tokio runtime handle
pub fn handle() -> tokio::runtime::Handle {
    runtime().handle().clone()
}

/// Drive a future to completion on the calling thread
pub fn block_on<F: Future>(future: F) -> F::Output {
    runtime().block_on(future)
}

/// Run blocking work on the runtime's blocking pool
pub fn spawn_blocking<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    handle().spawn_blocking(f)
}
