//! Leader election
//!
//! Exactly one controller is `Active` at a time. The leader holds a lease on
//! a named lock and renews it every `ttl / 2`; any renewal failure demotes it
//! to `Standby` on the spot. Standby controllers watch the lock and retry
//! whenever they see it released (or after one ttl, for backends whose
//! release notifications can be late).

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::store::{MetadataStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderState {
    Standby,
    Active,
}

impl std::fmt::Display for LeaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderState::Standby => write!(f, "standby"),
            LeaderState::Active => write!(f, "active"),
        }
    }
}

pub struct LeaderElection {
    store: Arc<dyn MetadataStore>,
    lock_name: String,
    id: String,
    ttl: Duration,
    state: watch::Sender<LeaderState>,
}

impl LeaderElection {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        lock_name: impl Into<String>,
        id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let (state, _) = watch::channel(LeaderState::Standby);
        Self {
            store,
            lock_name: lock_name.into(),
            id: id.into(),
            ttl,
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == LeaderState::Active
    }

    /// Receiver of every state transition
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// Holder of the leader lock as the store currently sees it
    pub async fn current_leader(&self) -> Result<Option<String>, StoreError> {
        let mut watch = self.store.watch_lock(&self.lock_name).await?;
        Ok(watch.next().await.and_then(|event| event.holder))
    }

    fn set_state(&self, next: LeaderState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!("Controller {} is now {}", self.id, next);
        }
    }

    /// Run the election loop until `shutdown` flips to true
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Controller {} joining election for {} (ttl {:?})",
            self.id, self.lock_name, self.ttl
        );
        while !shutting_down(&shutdown) {
            match self
                .store
                .acquire_lock(&self.lock_name, &self.id, self.ttl)
                .await
            {
                Ok(()) => {
                    self.set_state(LeaderState::Active);
                    self.hold(&mut shutdown).await;
                    self.set_state(LeaderState::Standby);
                }
                Err(StoreError::AlreadyHeld { holder, .. }) => {
                    debug!("Leader lock held by {}", holder);
                    self.wait_for_release(&mut shutdown).await;
                }
                Err(e) => {
                    warn!("Failed to acquire leader lock: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.ttl / 2) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        if let Err(e) = self.store.release_lock(&self.lock_name, &self.id).await {
            warn!("Failed to release leader lock: {}", e);
        }
        self.set_state(LeaderState::Standby);
    }

    /// Keep renewing until renewal fails or shutdown is requested
    async fn hold(&self, shutdown: &mut watch::Receiver<bool>) {
        let period = self.ttl / 2;
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            let renewal = self
                .store
                .renew_lock(&self.lock_name, &self.id, self.ttl);
            match tokio::time::timeout(period, renewal).await {
                Ok(Ok(())) => debug!("Renewed leader lease"),
                Ok(Err(e)) => {
                    warn!("Leader lease renewal failed: {}", e);
                    return;
                }
                Err(_) => {
                    warn!("Leader lease renewal timed out after {:?}", period);
                    return;
                }
            }
        }
    }

    async fn wait_for_release(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut watch = match self.store.watch_lock(&self.lock_name).await {
            Ok(watch) => watch,
            Err(e) => {
                warn!("Failed to watch leader lock: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(self.ttl / 2) => {}
                    _ = shutdown.changed() => {}
                }
                return;
            }
        };
        let retry = tokio::time::sleep(self.ttl);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                event = watch.next() => match event {
                    Some(event) if !event.held => {
                        debug!("Leader lock released");
                        return;
                    }
                    Some(_) => {}
                    None => return,
                },
                _ = &mut retry => return,
                _ = shutdown.changed() => return,
            }
        }
    }
}

/// `LockLost` unless `leadership` currently reports Active
///
/// Orchestrators call this right before every CAS, so work started while
/// Active cannot commit after a demotion.
pub fn ensure_active(leadership: &watch::Receiver<LeaderState>) -> Result<(), ControllerError> {
    if *leadership.borrow() == LeaderState::Active {
        Ok(())
    } else {
        Err(ControllerError::LockLost)
    }
}

/// True once shutdown was requested or its sender is gone
fn shutting_down(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}
