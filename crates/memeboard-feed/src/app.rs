//! Process-wide feed state with an explicit lifecycle.
//!
//! Startup sequence:
//! 1. Install the session (profile resolution starts in the background)
//! 2. Start the change-feed subscription
//! 3. Bulk load posts and comments
//!
//! Notifications that arrive during the bulk load are applied on top of
//! whatever is loaded; the entity store's dedup keeps redeliveries harmless.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::backend::{ChangeFeed, FeedBackend};
use crate::coordinator::Coordinator;
use crate::identity::IdentityCache;
use crate::inflight::InFlight;
use crate::reconciler::{ReconnectPolicy, Reconciler, Subscription, SubscriptionState};
use crate::state::FeedSnapshot;
use crate::store::EntityStore;
use crate::{BlobRef, Comment, FeedError, PostId, Profile, Session};

/// The feed engine: entity store, identity, actions and live updates.
pub struct FeedApp {
    backend: Arc<dyn FeedBackend>,
    feed: Arc<dyn ChangeFeed>,
    store: Arc<EntityStore>,
    identity: Arc<IdentityCache>,
    inflight: Arc<InFlight>,
    coordinator: Coordinator,
    policy: ReconnectPolicy,
    subscription: Mutex<Option<Subscription>>,
}

impl FeedApp {
    pub fn new(backend: Arc<dyn FeedBackend>, feed: Arc<dyn ChangeFeed>) -> Self {
        let store = EntityStore::new();
        let identity = IdentityCache::new(Arc::clone(&backend));
        let inflight = InFlight::new();
        let coordinator = Coordinator::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&identity),
            Arc::clone(&inflight),
        );

        Self {
            backend,
            feed,
            store,
            identity,
            inflight,
            coordinator,
            policy: ReconnectPolicy::default(),
            subscription: Mutex::new(None),
        }
    }

    /// Set the change-feed reconnect delays.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Install the session, start live updates and load the feed.
    ///
    /// A failed bulk load is returned, but the subscription keeps running.
    pub async fn start(&self, session: Option<Session>) -> Result<(), FeedError> {
        info!(signed_in = session.is_some(), "starting feed");
        self.set_session(session).await;

        {
            let mut subscription = self.subscription.lock().await;
            if subscription.is_none() {
                let reconciler = Reconciler::new(
                    Arc::clone(&self.feed),
                    Arc::clone(&self.backend),
                    Arc::clone(&self.store),
                    Arc::clone(&self.inflight),
                )
                .with_policy(self.policy);
                *subscription = Some(reconciler.spawn());
            }
        }

        self.refresh().await
    }

    /// Replace the signed-in session.
    ///
    /// In-flight actions of a previous user keep their guards until they
    /// complete, so a post never has two votes in flight.
    pub async fn set_session(&self, session: Option<Session>) {
        let previous = self.identity.current_user().await;
        let next = session.as_ref().map(|s| s.user_id.clone());
        if previous.is_some() && previous != next && !self.inflight.is_empty() {
            debug!(
                in_flight = self.inflight.len(),
                "signed-in user changed with actions in flight"
            );
        }
        self.identity.set_session(session).await;
    }

    /// Bulk load posts and their comments.
    pub async fn refresh(&self) -> Result<(), FeedError> {
        self.coordinator.refresh().await.inspect_err(|e| warn!(error = %e, "feed refresh failed"))
    }

    /// Current feed snapshot.
    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        self.store.snapshot()
    }

    /// Receive every new feed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FeedSnapshot>> {
        self.store.subscribe()
    }

    pub fn identity(&self) -> &Arc<IdentityCache> {
        &self.identity
    }

    /// Change-feed connection state; `Closed` when not started.
    pub async fn subscription_state(&self) -> SubscriptionState {
        self.subscription
            .lock()
            .await
            .as_ref()
            .map(Subscription::state)
            .unwrap_or(SubscriptionState::Closed)
    }

    /// Watch change-feed connection state, if started.
    pub async fn subscribe_state(&self) -> Option<watch::Receiver<SubscriptionState>> {
        self.subscription
            .lock()
            .await
            .as_ref()
            .map(Subscription::subscribe_state)
    }

    pub async fn vote(&self, post_id: PostId) -> Result<(), FeedError> {
        self.coordinator.vote(post_id).await
    }

    pub async fn submit_comment(&self, post_id: PostId, content: &str) -> Result<Comment, FeedError> {
        self.coordinator.submit_comment(post_id, content).await
    }

    pub fn set_draft(&self, post_id: PostId, text: impl Into<String>) {
        self.coordinator.set_draft(post_id, text);
    }

    pub fn draft(&self, post_id: PostId) -> Option<String> {
        self.coordinator.draft(post_id)
    }

    pub async fn submit_draft(&self, post_id: PostId) -> Result<Comment, FeedError> {
        self.coordinator.submit_draft(post_id).await
    }

    pub async fn upload_post(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        title: Option<&str>,
    ) -> Result<BlobRef, FeedError> {
        self.coordinator.upload_post(file_name, bytes, title).await
    }

    pub async fn edit_display_name(&self, name: &str) -> Result<Profile, FeedError> {
        self.coordinator.edit_display_name(name).await
    }

    /// Stop live updates and pending identity work.
    pub async fn shutdown(&self) {
        let subscription = self.subscription.lock().await.take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe().await;
        }
        self.identity.shutdown().await;
        info!("feed shut down");
    }
}
