//! Optimistic mutation coordinator.
//!
//! Every user action runs through here: votes are applied locally before
//! the remote call and rolled back on failure, comments are appended only
//! once the collaborator returns the stored row. Each action holds an
//! [`InFlightGuard`] for its key until it completes, so a repeated tap is
//! dropped instead of queued.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::FeedBackend;
use crate::identity::IdentityCache;
use crate::inflight::{InFlight, InFlightGuard, InFlightKey};
use crate::store::EntityStore;
use crate::{
    BlobRef, Comment, DISPLAY_NAME_MAX, DISPLAY_NAME_MIN, FeedError, NewPost, PostId, Profile,
    Session, UserId,
};

/// Applies user actions against the store and the collaborator.
pub struct Coordinator {
    backend: Arc<dyn FeedBackend>,
    store: Arc<EntityStore>,
    identity: Arc<IdentityCache>,
    inflight: Arc<InFlight>,
    /// Unsent comment text per post.
    drafts: DashMap<PostId, String>,
}

impl Coordinator {
    pub fn new(
        backend: Arc<dyn FeedBackend>,
        store: Arc<EntityStore>,
        identity: Arc<IdentityCache>,
        inflight: Arc<InFlight>,
    ) -> Self {
        Self {
            backend,
            store,
            identity,
            inflight,
            drafts: DashMap::new(),
        }
    }

    /// Upvote a post.
    ///
    /// The local count moves first. On failure it is restored exactly and
    /// the error is returned.
    pub async fn vote(&self, post_id: PostId) -> Result<(), FeedError> {
        let session = self.require_session().await?;
        if self.store.snapshot().post(post_id).is_none() {
            return Err(FeedError::NotFound {
                entity: "post",
                id: post_id.to_string(),
            });
        }

        let _guard = self.acquire(InFlightKey::Vote(post_id))?;
        self.store.adjust_vote(post_id, 1);
        let mut pending = PendingVote {
            store: &self.store,
            post_id,
            settled: false,
        };

        match self.backend.increment_vote(&session, post_id).await {
            Ok(()) => {
                pending.settle(true);
                debug!(post_id = %post_id, "vote committed");
                Ok(())
            }
            Err(e) => {
                pending.settle(false);
                warn!(post_id = %post_id, error = %e, "vote failed, rolled back");
                Err(FeedError::RemoteFailure(e))
            }
        }
    }

    /// Post a comment.
    ///
    /// Nothing is shown until the collaborator returns the stored row. On
    /// success the post's draft is cleared; on failure it is kept.
    pub async fn submit_comment(&self, post_id: PostId, content: &str) -> Result<Comment, FeedError> {
        let session = self.require_session().await?;
        let content = content.trim();
        if content.is_empty() {
            return Err(FeedError::Validation("comment is empty".to_string()));
        }
        let author_name = self.require_display_name().await?;

        let _guard = self.acquire(InFlightKey::Comment(post_id))?;
        let row = self
            .backend
            .insert_comment(&session, post_id, content)
            .await
            .inspect_err(|e| warn!(post_id = %post_id, error = %e, "comment submit failed"))?;

        let comment = row.into_comment(Some(author_name.as_str()));
        self.store.append_comment(comment.clone());
        self.drafts.remove(&post_id);
        debug!(post_id = %post_id, comment_id = %comment.id, "comment stored");
        Ok(comment)
    }

    /// Store unsent comment text for a post. Blank text clears the draft.
    pub fn set_draft(&self, post_id: PostId, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            self.drafts.remove(&post_id);
        } else {
            self.drafts.insert(post_id, text);
        }
    }

    /// Unsent comment text for a post.
    pub fn draft(&self, post_id: PostId) -> Option<String> {
        self.drafts.get(&post_id).map(|d| d.value().clone())
    }

    /// Submit the stored draft for a post.
    pub async fn submit_draft(&self, post_id: PostId) -> Result<Comment, FeedError> {
        let text = self.draft(post_id).unwrap_or_default();
        self.submit_comment(post_id, &text).await
    }

    /// Upload an image and create a post for it, then reload the feed.
    pub async fn upload_post(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        title: Option<&str>,
    ) -> Result<BlobRef, FeedError> {
        let session = self.require_session().await?;
        if bytes.is_empty() {
            return Err(FeedError::Validation(format!("{} is empty", file_name)));
        }

        let _guard = self.acquire(InFlightKey::Upload)?;
        let extension = file_extension(file_name);
        let path = blob_path(&session.user_id, &extension, Utc::now(), Uuid::new_v4());
        let size = bytes.len();

        let blob = self
            .backend
            .upload_blob(&session, &path, bytes, content_type(&extension))
            .await
            .inspect_err(|e| warn!(path = %path, error = %e, "blob upload failed"))?;
        info!(path = %blob.path, size, "image uploaded");

        let post = NewPost {
            title: post_title(title, file_name),
            image_ref: blob.public_ref.clone(),
            author_id: session.user_id.clone(),
        };
        self.backend
            .insert_post(&session, &post)
            .await
            .inspect_err(|e| warn!(path = %blob.path, error = %e, "post insert failed"))?;

        self.refresh().await?;
        Ok(blob)
    }

    /// Change the signed-in user's display name.
    pub async fn edit_display_name(&self, name: &str) -> Result<Profile, FeedError> {
        let session = self.require_session().await?;
        let name = validate_display_name(name)?;

        let profile = self.backend.update_profile(&session, name).await?;
        self.identity.invalidate(&session.user_id);
        self.identity.refresh_current().await;
        info!(user_id = %session.user_id, name = %name, "display name updated");
        Ok(profile)
    }

    /// Bulk load posts and their comments.
    pub async fn refresh(&self) -> Result<(), FeedError> {
        let posts = self.backend.list_posts().await?;
        let post_ids: Vec<PostId> = posts.iter().map(|p| p.id).collect();
        self.store.replace_all(posts);
        if post_ids.is_empty() {
            return Ok(());
        }

        let rows = self.backend.list_comments(&post_ids).await?;
        let mut by_post: BTreeMap<PostId, Vec<Comment>> = BTreeMap::new();
        for row in rows {
            by_post.entry(row.post_id).or_default().push(row.into());
        }
        let comments: usize = by_post.values().map(Vec::len).sum();
        for (post_id, batch) in by_post {
            self.store.merge_comments(post_id, batch);
        }

        debug!(posts = post_ids.len(), comments, "feed refreshed");
        Ok(())
    }

    async fn require_session(&self) -> Result<Session, FeedError> {
        self.identity
            .current_session()
            .await
            .ok_or(FeedError::AuthRequired)
    }

    /// Display name from the resolved profile.
    ///
    /// Waits for a resolution already in progress but never fetches; a
    /// failed resolution is only retried by a session change or an edit.
    async fn require_display_name(&self) -> Result<String, FeedError> {
        let profile = match self.identity.current_profile().await {
            Some(profile) => Some(profile),
            None => {
                self.identity.settle().await;
                self.identity.current_profile().await
            }
        };
        profile
            .and_then(|p| p.display_name)
            .filter(|name| !name.trim().is_empty())
            .ok_or(FeedError::DisplayNameRequired)
    }

    fn acquire(&self, key: InFlightKey) -> Result<InFlightGuard, FeedError> {
        self.inflight
            .try_acquire(key)
            .inspect_err(|_| debug!(%key, "dropping repeated action"))
    }
}

/// Optimistic vote awaiting its remote outcome.
///
/// Dropped without being settled (the action's future was cancelled), it
/// rolls back.
struct PendingVote<'a> {
    store: &'a EntityStore,
    post_id: PostId,
    settled: bool,
}

impl PendingVote<'_> {
    fn settle(&mut self, committed: bool) {
        self.settled = true;
        self.store.settle_vote(self.post_id, committed);
    }
}

impl Drop for PendingVote<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.store.settle_vote(self.post_id, false);
        }
    }
}

fn validate_display_name(name: &str) -> Result<&str, FeedError> {
    let name = name.trim();
    let len = name.chars().count();
    if !(DISPLAY_NAME_MIN..=DISPLAY_NAME_MAX).contains(&len) {
        return Err(FeedError::Validation(format!(
            "display name must be {} to {} characters",
            DISPLAY_NAME_MIN, DISPLAY_NAME_MAX
        )));
    }
    Ok(name)
}

fn file_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "jpg".to_string())
}

fn blob_path(user_id: &UserId, extension: &str, now: DateTime<Utc>, nonce: Uuid) -> String {
    format!(
        "{}/{}-{}.{}",
        user_id,
        now.timestamp_millis(),
        nonce,
        extension
    )
}

fn content_type(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

fn post_title(title: Option<&str>, file_name: &str) -> String {
    match title.map(str::trim) {
        Some(title) if !title.is_empty() => title.to_string(),
        _ => file_name.to_string(),
    }
}
