//! Lock event fan-out for in-process backends

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{LockEvent, LockWatch};

pub(crate) struct LockEventHub {
    tx: broadcast::Sender<(String, LockEvent)>,
}

impl LockEventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn publish(&self, event: Option<(String, LockEvent)>) {
        if let Some(event) = event {
            // no subscribers is fine
            let _ = self.tx.send(event);
        }
    }

    /// Subscribe to one lock
    ///
    /// `current` reads the lock state; it runs once up front and again
    /// whenever the subscriber lagged behind and missed events.
    pub fn watch<F>(&self, name: &str, current: F) -> LockWatch
    where
        F: Fn() -> Option<LockEvent> + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let (tx, watch) = LockWatch::channel();
        let name = name.to_string();
        let initial = current();

        tokio::spawn(async move {
            let Some(initial) = initial else { return };
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                let event = match rx.recv().await {
                    Ok((lock, event)) if lock == name => event,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => match current() {
                        Some(event) => event,
                        None => return,
                    },
                    Err(RecvError::Closed) => return,
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        watch
    }
}
