//! Contracts of the external storage/auth collaborator.
//!
//! [`FeedBackend`] covers request/response calls; [`ChangeFeed`] covers the
//! push channel. `RestClient` and `RealtimeClient` are the network
//! implementations; tests substitute in-memory ones.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    BackendError, BlobRef, CommentId, CommentRow, NewPost, Post, PostId, PostPatch, Profile,
    Session, UserId,
};

/// Row-level calls against the authoritative store.
#[async_trait]
pub trait FeedBackend: Send + Sync {
    /// All posts, newest first.
    async fn list_posts(&self) -> Result<Vec<Post>, BackendError>;

    /// Comments for the given posts, oldest first, with author names joined.
    async fn list_comments(&self, post_ids: &[PostId]) -> Result<Vec<CommentRow>, BackendError>;

    /// Point lookup of one comment. `Ok(None)` when the row is missing or
    /// not yet visible.
    async fn get_comment(&self, id: CommentId) -> Result<Option<CommentRow>, BackendError>;

    /// Profile for a user, if one exists.
    async fn get_profile(&self, user_id: &UserId) -> Result<Option<Profile>, BackendError>;

    /// Set a user's display name.
    async fn update_profile(
        &self,
        session: &Session,
        display_name: &str,
    ) -> Result<Profile, BackendError>;

    /// Insert a post row.
    async fn insert_post(&self, session: &Session, post: &NewPost) -> Result<(), BackendError>;

    /// Upload image bytes and return their public reference.
    async fn upload_blob(
        &self,
        session: &Session,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<BlobRef, BackendError>;

    /// Atomically increment a post's vote count.
    ///
    /// Not idempotent: a dropped-then-retried request may count twice.
    async fn increment_vote(&self, session: &Session, post_id: PostId) -> Result<(), BackendError>;

    /// Insert a comment and return the stored row.
    async fn insert_comment(
        &self,
        session: &Session,
        post_id: PostId,
        content: &str,
    ) -> Result<CommentRow, BackendError>;
}

/// A row-level notification from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A post row was updated; the payload carries the changed fields.
    PostUpdated(PostPatch),
    /// A comment row was inserted; only identifiers are guaranteed.
    CommentInserted {
        id: CommentId,
        post_id: Option<PostId>,
    },
}

/// Push channel delivering row-level changes at least once, best effort.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a connection and return its event stream.
    async fn connect(&self) -> Result<ChangeStream, BackendError>;
}

/// Events from one change-feed connection.
///
/// The stream ends (or yields an error) when the connection drops. Dropping
/// the stream stops the connection's pump task.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<ChangeEvent, BackendError>>,
    pump: Option<JoinHandle<()>>,
}

impl ChangeStream {
    /// Wrap a channel fed by some producer.
    pub fn new(rx: mpsc::Receiver<Result<ChangeEvent, BackendError>>) -> Self {
        Self { rx, pump: None }
    }

    /// Wrap a channel together with the task that feeds it.
    pub fn with_pump(
        rx: mpsc::Receiver<Result<ChangeEvent, BackendError>>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            pump: Some(pump),
        }
    }

    /// Next event, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent, BackendError>> {
        self.rx.recv().await
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
