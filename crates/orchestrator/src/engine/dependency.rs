//! Completion notifications for chaining dependent activities.
//!
//! An activity started with an upstream [`Completion`] waits for it before it
//! takes a limiter token. The wait wakes exactly once and never polls; an
//! upstream that already finished, or whose task was dropped, counts as done.

use tokio::sync::watch;

/// Fires the paired [`Completion`]s.
#[derive(Debug)]
pub struct CompletionSender(watch::Sender<bool>);

impl CompletionSender {
    /// Mark the activity complete.
    pub fn complete(self) {
        // Receivers may all be gone; nobody is waiting then.
        let _ = self.0.send(true);
    }
}

/// Resolves when an activity has finished.
#[derive(Debug, Clone)]
pub struct Completion(watch::Receiver<bool>);

impl Completion {
    /// A completion that is already resolved.
    pub fn done() -> Self {
        let (_, receiver) = watch::channel(true);
        Self(receiver)
    }

    /// Whether the activity has finished or was dropped.
    pub fn is_done(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Wait until the activity has finished or was dropped.
    pub async fn wait(&self) {
        let mut receiver = self.0.clone();
        // An error means the sender is gone, which also releases waiters.
        let _ = receiver.wait_for(|done| *done).await;
    }
}

/// Create a connected sender and completion.
pub fn completion() -> (CompletionSender, Completion) {
    let (sender, receiver) = watch::channel(false);
    (CompletionSender(sender), Completion(receiver))
}
