//! Change-feed reconciler.
//!
//! Runs one long-lived task that keeps a change-feed connection open and
//! folds its notifications into the entity store:
//!
//! ```text
//! Connecting ──► Active ──► Error ──► (backoff) ──► Connecting
//!      │            │
//!      └────────────┴──► Closed   (only on unsubscribe)
//! ```
//!
//! Notifications missed while disconnected are not replayed; the next bulk
//! refresh recovers them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backend::{ChangeEvent, ChangeFeed, FeedBackend};
use crate::inflight::{InFlight, InFlightKey};
use crate::store::EntityStore;
use crate::{CommentId, FeedError, PostId, PostPatch};

/// Connection state of the change-feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Active,
    Error,
    /// Terminal.
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Active => "active",
            SubscriptionState::Error => "error",
            SubscriptionState::Closed => "closed",
        })
    }
}

/// Reconnect delays.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial,
            initial_interval: self.initial,
            max_interval: self.max,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Folds change-feed notifications into the entity store.
pub struct Reconciler {
    feed: Arc<dyn ChangeFeed>,
    backend: Arc<dyn FeedBackend>,
    store: Arc<EntityStore>,
    inflight: Arc<InFlight>,
    policy: ReconnectPolicy,
}

impl Reconciler {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        backend: Arc<dyn FeedBackend>,
        store: Arc<EntityStore>,
        inflight: Arc<InFlight>,
    ) -> Self {
        Self {
            feed,
            backend,
            store,
            inflight,
            policy: ReconnectPolicy::default(),
        }
    }

    /// Override the reconnect delays.
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start the subscription task.
    pub fn spawn(self) -> Subscription {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(watch::Sender::new(SubscriptionState::Connecting));

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { self.run(&state, shutdown_rx).await })
        };

        Subscription {
            shutdown_tx,
            state,
            task: Some(task),
        }
    }

    async fn run(
        &self,
        state: &watch::Sender<SubscriptionState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut backoff = self.policy.backoff();

        'reconnect: loop {
            set_state(state, SubscriptionState::Connecting);

            let connected = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break 'reconnect,
                result = self.feed.connect() => result,
            };

            match connected {
                Ok(mut stream) => {
                    info!("change feed connected");
                    set_state(state, SubscriptionState::Active);
                    backoff.reset();

                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => break 'reconnect,
                            next = stream.next() => match next {
                                // A slow lookup must not hold up shutdown.
                                Some(Ok(event)) => tokio::select! {
                                    biased;
                                    _ = shutdown_rx.changed() => break 'reconnect,
                                    _ = self.handle_event(event) => {}
                                },
                                Some(Err(e)) => {
                                    warn!(error = %e, "change feed error");
                                    break;
                                }
                                None => {
                                    warn!("change feed closed");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => warn!(error = %e, "change feed connect failed"),
            }

            set_state(state, SubscriptionState::Error);
            let wait = backoff.next_backoff().unwrap_or(self.policy.max);
            debug!(wait_ms = wait.as_millis() as u64, "change feed reconnecting after backoff");
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break 'reconnect,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        set_state(state, SubscriptionState::Closed);
        info!("change feed subscription closed");
    }

    /// Apply one notification.
    ///
    /// Failures are logged and swallowed; reconciliation never surfaces
    /// errors to the user.
    pub async fn handle_event(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::PostUpdated(patch) => self.post_updated(patch),
            ChangeEvent::CommentInserted { id, post_id } => {
                match self.comment_inserted(id, post_id).await {
                    Ok(()) => {}
                    Err(e @ FeedError::NotFound { .. }) => debug!(error = %e, "comment lookup missed"),
                    Err(e) => warn!(comment_id = %id, error = %e, "comment lookup failed"),
                }
            }
        }
    }

    fn post_updated(&self, patch: PostPatch) {
        let post_id = patch.id;
        let vote_in_flight = self.inflight.is_in_flight(InFlightKey::Vote(post_id));
        trace!(post_id = %post_id, vote_in_flight, "post update received");
        self.store.merge_post_guarded(patch, vote_in_flight);
    }

    async fn comment_inserted(
        &self,
        id: CommentId,
        post_id: Option<PostId>,
    ) -> Result<(), FeedError> {
        if let Some(post_id) = post_id
            && self
                .store
                .snapshot()
                .comments(post_id)
                .iter()
                .any(|c| c.id == id)
        {
            trace!(comment_id = %id, "comment already present");
            return Ok(());
        }

        let row = self
            .backend
            .get_comment(id)
            .await?
            .ok_or_else(|| FeedError::NotFound {
                entity: "comment",
                id: id.to_string(),
            })?;
        self.store.append_comment(row.into());
        Ok(())
    }
}

fn set_state(state: &watch::Sender<SubscriptionState>, next: SubscriptionState) {
    state.send_if_modified(|current| {
        // Closed is terminal.
        if *current == next || *current == SubscriptionState::Closed {
            return false;
        }
        debug!(from = %current, to = %next, "subscription state");
        *current = next;
        true
    });
}

/// Handle to a running change-feed subscription.
///
/// Dropping the handle stops the task.
pub struct Subscription {
    shutdown_tx: watch::Sender<bool>,
    state: Arc<watch::Sender<SubscriptionState>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Current connection state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Stop the subscription and wait for the task to finish.
    pub async fn unsubscribe(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "change feed task failed");
        }
        set_state(&self.state, SubscriptionState::Closed);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.shutdown_tx.send(true);
            task.abort();
            set_state(&self.state, SubscriptionState::Closed);
        }
    }
}
