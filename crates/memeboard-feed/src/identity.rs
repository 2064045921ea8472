//! Identity cache: the current session and resolved profiles.
//!
//! Profile resolution is asynchronous. Each session change bumps a
//! generation counter, and a fetch only lands if the generation it started
//! under is still current when it completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::backend::FeedBackend;
use crate::{Profile, Session, UserId};

/// Holds the current session and cached profiles.
pub struct IdentityCache {
    backend: Arc<dyn FeedBackend>,
    /// Current session (singleton).
    session: RwLock<Option<Session>>,
    /// Cached profiles by user id.
    profiles: DashMap<UserId, Profile>,
    /// Bumped on every session change.
    generation: AtomicU64,
    /// Pending resolution for the current session.
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl IdentityCache {
    /// Create a cache with no session.
    pub fn new(backend: Arc<dyn FeedBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            session: RwLock::new(None),
            profiles: DashMap::new(),
            generation: AtomicU64::new(0),
            pending: Mutex::new(None),
        })
    }

    /// Replace the current session.
    ///
    /// Without a session the current profile is cleared before this returns.
    /// With one, the profile is resolved in the background.
    pub async fn set_session(self: &Arc<Self>, session: Option<Session>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let previous = {
            let mut guard = self.session.write().await;
            std::mem::replace(&mut *guard, session.clone())
        };
        if let Some(previous) = previous
            && session.as_ref().map(|s| &s.user_id) != Some(&previous.user_id)
        {
            self.profiles.remove(&previous.user_id);
        }

        let mut pending = self.pending.lock().await;
        if let Some(stale) = pending.take() {
            stale.abort();
        }

        let Some(session) = session else {
            debug!(generation, "identity: session cleared");
            return;
        };

        debug!(user_id = %session.user_id, generation, "identity: session set, resolving profile");
        let cache = Arc::clone(self);
        *pending = Some(tokio::spawn(async move {
            cache.resolve(session.user_id, generation).await;
        }));
    }

    /// Current session, if signed in.
    pub async fn current_session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Current user id, if signed in.
    pub async fn current_user(&self) -> Option<UserId> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.user_id.clone())
    }

    /// Resolved profile of the current user, if any.
    pub async fn current_profile(&self) -> Option<Profile> {
        let user_id = self.current_user().await?;
        self.profiles.get(&user_id).map(|p| p.value().clone())
    }

    /// Cached profile for a user, fetching it on a miss.
    ///
    /// Fetch failures are logged and yield `None`.
    pub async fn get_profile(&self, user_id: &UserId) -> Option<Profile> {
        if let Some(cached) = self.profiles.get(user_id) {
            return Some(cached.value().clone());
        }

        match self.backend.get_profile(user_id).await {
            Ok(Some(profile)) => {
                self.profiles.insert(user_id.clone(), profile.clone());
                Some(profile)
            }
            Ok(None) => {
                trace!(user_id = %user_id, "identity: no profile row");
                None
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "identity: profile fetch failed");
                None
            }
        }
    }

    /// Drop the cached profile for a user.
    pub fn invalidate(&self, user_id: &UserId) {
        if self.profiles.remove(user_id).is_some() {
            trace!(user_id = %user_id, "identity: profile invalidated");
        }
    }

    /// Re-resolve the current user's profile and wait for the result.
    pub async fn refresh_current(&self) -> Option<Profile> {
        let user_id = self.current_user().await?;
        let generation = self.generation.load(Ordering::SeqCst);
        self.resolve(user_id.clone(), generation).await;
        self.profiles.get(&user_id).map(|p| p.value().clone())
    }

    /// Wait for the pending background resolution, if any.
    pub async fn settle(&self) {
        let handle = self.pending.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(error = %e, "identity: profile resolution task failed");
        }
    }

    /// Abort any pending profile resolution.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.pending.lock().await.take() {
            handle.abort();
            debug!("identity: pending resolution aborted");
        }
    }

    /// Generation of the current session.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn resolve(&self, user_id: UserId, generation: u64) {
        let result = self.backend.get_profile(&user_id).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(user_id = %user_id, generation, "identity: discarding profile for superseded session");
            return;
        }

        match result {
            Ok(Some(profile)) => {
                debug!(user_id = %user_id, name = %profile.name_or_anonymous(), "identity: profile resolved");
                self.profiles.insert(user_id, profile);
            }
            Ok(None) => {
                debug!(user_id = %user_id, "identity: no profile row yet");
                self.profiles.remove(&user_id);
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "identity: profile fetch failed");
            }
        }
    }
}
