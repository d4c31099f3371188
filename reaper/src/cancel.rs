//! A broadcast, raise-once cancellation signal.
//!
//! One `CancelSignal` is created per unit of cancellable work (a drain, or the process's hold on
//! leadership). Every task gets its own `CancelListener`. Raising is not consumed by any one listener:
//! all of them see it, including listeners created afterwards.
use tokio::sync::watch;

#[derive(Debug)]
pub struct CancelSignal {
    sender: watch::Sender<bool>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        CancelSignal { sender }
    }

    /// Raises the signal. Raising more than once, or after every listener has gone away, is harmless.
    pub fn raise(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_raised(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn listener(&self) -> CancelListener {
        CancelListener {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CancelListener {
    receiver: watch::Receiver<bool>,
}

impl CancelListener {
    /// A listener whose signal can never be raised.
    pub fn never() -> Self {
        CancelSignal::new().listener()
    }

    pub fn is_raised(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once the signal is raised. Never completes if the signal is dropped unraised.
    pub async fn raised(&mut self) {
        if self.receiver.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
