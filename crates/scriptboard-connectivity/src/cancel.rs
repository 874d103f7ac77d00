//! One-way cancellation flag shared by a component and its async continuations.

use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation token owned by one component instance.
///
/// Cloning shares the flag. Once [`cancel`](Self::cancel) has been called the
/// token stays cancelled; there is no way to re-arm it. Every async
/// continuation checks it before mutating component state.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    flag: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    /// Mark the token inert. Returns `true` if this call performed the transition.
    pub fn cancel(&self) -> bool {
        !self.flag.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the token has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so `wait_for` only returns once the flag flips.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
