use tokio::task::JoinHandle;
use tracing::debug;

/// Something that tears down a live push-stream connection.
pub trait Release: Send {
    fn release(&mut self);
}

impl Release for JoinHandle<()> {
    fn release(&mut self) {
        self.abort();
    }
}

/// Owning handle for a progress-stream subscription.
///
/// Released at most once: the first `close()` (or the drop, if nobody closed
/// it) runs the release, every later call is a no-op.
pub struct Subscription {
    attempt: u64,
    handle: Option<Box<dyn Release>>,
}

impl Subscription {
    pub fn new(attempt: u64, handle: impl Release + 'static) -> Self {
        Self {
            attempt,
            handle: Some(Box::new(handle)),
        }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Returns `true` if this call performed the release.
    pub fn close(&mut self) -> bool {
        match self.handle.take() {
            Some(mut h) => {
                h.release();
                debug!(attempt = self.attempt, "progress subscription released");
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attempt", &self.attempt)
            .field("closed", &self.is_closed())
            .finish()
    }
}
