//! Entity store for posts and comments.
//!
//! Holds the latest [`FeedSnapshot`] in a `watch` channel. Each mutation
//! reduces the current snapshot and publishes the result as a whole, so
//! subscribers see every change and never a torn record.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::state::{FeedSnapshot, Rejection, StoreEvent, Transition};
use crate::{Comment, Post, PostId, PostPatch};

/// Result of applying one store event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new snapshot was published.
    Changed,
    /// The event was a no-op.
    Unchanged,
    /// The event was refused and logged.
    Rejected(Rejection),
}

/// Authoritative-known state of posts and comments.
pub struct EntityStore {
    tx: watch::Sender<Arc<FeedSnapshot>>,
}

impl EntityStore {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        self.tx.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FeedSnapshot>> {
        self.tx.subscribe()
    }

    /// Apply an event through the reducer and publish the outcome.
    pub fn apply(&self, event: StoreEvent) -> Applied {
        let mut applied = Applied::Unchanged;
        self.tx.send_if_modified(|current| match current.reduce(&event) {
            Transition::Changed(next) => {
                *current = Arc::new(next);
                applied = Applied::Changed;
                true
            }
            Transition::Unchanged => false,
            Transition::Rejected(reason) => {
                applied = Applied::Rejected(reason);
                false
            }
        });

        match applied {
            Applied::Rejected(reason) => warn!(?reason, "store: event rejected"),
            Applied::Unchanged => trace!("store: event was a no-op"),
            Applied::Changed => {}
        }
        applied
    }

    /// Replace the post collection after a bulk load.
    pub fn replace_all(&self, posts: Vec<Post>) -> Applied {
        let count = posts.len();
        let applied = self.apply(StoreEvent::ReplaceAll { posts });
        debug!(posts = count, "store: posts replaced");
        applied
    }

    /// Overlay a partial post onto the stored record.
    ///
    /// Unknown posts are rejected: a post must originate from a full record.
    pub fn merge_post(&self, patch: PostPatch) -> Applied {
        self.merge_post_guarded(patch, false)
    }

    /// Like [`merge_post`](Self::merge_post), holding a lower vote count
    /// when `vote_in_flight` is set.
    pub fn merge_post_guarded(&self, patch: PostPatch, vote_in_flight: bool) -> Applied {
        let post_id = patch.id;
        let applied = self.apply(StoreEvent::MergePost {
            patch,
            vote_in_flight,
        });
        trace!(post_id = %post_id, ?applied, "store: post merged");
        applied
    }

    /// Merge comments for one post. Comments already present are skipped.
    pub fn merge_comments(&self, post_id: PostId, comments: Vec<Comment>) -> Applied {
        self.apply(StoreEvent::MergeComments { post_id, comments })
    }

    /// Append one comment. Duplicates are skipped; comments for posts that
    /// are not loaded are held until the post arrives.
    pub fn append_comment(&self, comment: Comment) -> Applied {
        let comment_id = comment.id;
        let post_id = comment.post_id;
        let applied = self.apply(StoreEvent::AppendComment { comment });
        trace!(comment_id = %comment_id, post_id = %post_id, ?applied, "store: comment appended");
        applied
    }

    /// Add `delta` to a post's vote count, floored at zero.
    pub fn adjust_vote(&self, post_id: PostId, delta: i64) -> Applied {
        self.apply(StoreEvent::AdjustVote { post_id, delta })
    }

    /// Complete an optimistic vote (rollback when not committed).
    pub fn settle_vote(&self, post_id: PostId, committed: bool) -> Applied {
        self.apply(StoreEvent::SettleVote { post_id, committed })
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        let (tx, _) = watch::channel(Arc::new(FeedSnapshot::new()));
        Self { tx }
    }
}
