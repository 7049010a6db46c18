use tokio::sync::{Semaphore, SemaphorePermit};

/// Caps the number of concurrent disk operations a torrent will have
/// in flight, independent of how many peers are pushing blocks at once.
/// Thin enough over `tokio::sync::Semaphore` that it's not worth pulling
/// that type into every module that needs one; this gives the engine a
/// single name to depend on instead.
pub struct AsyncSemaphore {
    inner: Semaphore,
}

impl AsyncSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Semaphore::new(permits),
        }
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.inner
            .acquire()
            .await
            .expect("semaphore never closed while torrent is alive")
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }
}
