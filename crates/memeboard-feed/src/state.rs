//! Immutable feed snapshots and the reducer that advances them.
//!
//! Every mutation of the entity store is a [`StoreEvent`] applied with
//! [`FeedSnapshot::reduce`], a pure `(snapshot, event) -> transition`
//! function. The store swaps whole snapshots, so readers never observe a
//! half-applied event.

use std::collections::{BTreeMap, HashSet};

use crate::{Comment, Post, PostId, PostPatch};

/// A mutation of the entity store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// Bulk load: replace the post collection.
    ReplaceAll { posts: Vec<Post> },
    /// Field-wise overlay onto an existing post.
    ///
    /// With `vote_in_flight` set, a vote count lower than the local one is
    /// held instead of applied.
    MergePost {
        patch: PostPatch,
        vote_in_flight: bool,
    },
    /// Merge a batch of comments for one post, dedup by id.
    MergeComments {
        post_id: PostId,
        comments: Vec<Comment>,
    },
    /// Append one comment, dedup by id.
    AppendComment { comment: Comment },
    /// Add `delta` to a post's vote count, floored at zero.
    AdjustVote { post_id: PostId, delta: i64 },
    /// Complete an optimistic vote.
    ///
    /// When not committed the optimistic +1 is rolled back. A vote count held
    /// while the vote was in flight is discarded on commit and applied after
    /// rollback otherwise.
    SettleVote { post_id: PostId, committed: bool },
}

/// Outcome of reducing one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The event produced a new snapshot.
    Changed(FeedSnapshot),
    /// The event was a no-op (duplicate, zero delta).
    Unchanged,
    /// The event was refused.
    Rejected(Rejection),
}

/// Why an event was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A partial record targeted a post that is not loaded.
    UnknownPost(PostId),
    /// A comment batch carried comments for a different post.
    MismatchedPost { expected: PostId, found: PostId },
}

/// Immutable view of the feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    /// Posts in bulk-load order (newest first).
    posts: Vec<Post>,
    /// Comments per loaded post, ordered by `(created_at, id)`.
    comments: BTreeMap<PostId, Vec<Comment>>,
    /// Comments whose post is not loaded yet.
    held_comments: BTreeMap<PostId, Vec<Comment>>,
    /// Feed vote counts held back while a local vote was in flight.
    held_votes: BTreeMap<PostId, u64>,
}

impl FeedSnapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts in display order.
    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    /// Look up a post.
    pub fn post(&self, id: PostId) -> Option<&Post> {
        self.posts.iter().find(|p| p.id == id)
    }

    /// Number of loaded posts.
    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    /// Comments for a loaded post, in render order.
    pub fn comments(&self, post_id: PostId) -> &[Comment] {
        self.comments
            .get(&post_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Total number of rendered comments.
    pub fn comment_count(&self) -> usize {
        self.comments.values().map(Vec::len).sum()
    }

    /// Number of comments waiting for their post to load.
    pub fn held_comment_count(&self) -> usize {
        self.held_comments.values().map(Vec::len).sum()
    }

    /// Vote count held back for a post, if any.
    pub fn held_vote(&self, post_id: PostId) -> Option<u64> {
        self.held_votes.get(&post_id).copied()
    }

    /// Apply one event.
    pub fn reduce(&self, event: &StoreEvent) -> Transition {
        match event {
            StoreEvent::ReplaceAll { posts } => Transition::Changed(self.replace_all(posts)),
            StoreEvent::MergePost {
                patch,
                vote_in_flight,
            } => self.merge_post(patch, *vote_in_flight),
            StoreEvent::MergeComments { post_id, comments } => {
                if let Some(stray) = comments.iter().find(|c| c.post_id != *post_id) {
                    return Transition::Rejected(Rejection::MismatchedPost {
                        expected: *post_id,
                        found: stray.post_id,
                    });
                }
                self.insert_comments(comments)
            }
            StoreEvent::AppendComment { comment } => {
                self.insert_comments(std::slice::from_ref(comment))
            }
            StoreEvent::AdjustVote { post_id, delta } => self.adjust_vote(*post_id, *delta),
            StoreEvent::SettleVote { post_id, committed } => {
                self.settle_vote(*post_id, *committed)
            }
        }
    }

    fn replace_all(&self, posts: &[Post]) -> FeedSnapshot {
        let mut seen = HashSet::with_capacity(posts.len());
        let posts: Vec<Post> = posts
            .iter()
            .filter(|p| seen.insert(p.id))
            .cloned()
            .collect();

        // Keep comment state only for posts that are still present.
        let mut comments: BTreeMap<PostId, Vec<Comment>> = self
            .comments
            .iter()
            .filter(|(id, _)| seen.contains(*id))
            .map(|(id, list)| (*id, list.clone()))
            .collect();

        let mut held_comments = BTreeMap::new();
        for (post_id, held) in &self.held_comments {
            if seen.contains(post_id) {
                let list = comments.entry(*post_id).or_default();
                for comment in held {
                    insert_sorted(list, comment);
                }
            } else {
                held_comments.insert(*post_id, held.clone());
            }
        }

        let held_votes = self
            .held_votes
            .iter()
            .filter(|(id, _)| seen.contains(*id))
            .map(|(id, votes)| (*id, *votes))
            .collect();

        FeedSnapshot {
            posts,
            comments,
            held_comments,
            held_votes,
        }
    }

    fn merge_post(&self, patch: &PostPatch, vote_in_flight: bool) -> Transition {
        let Some(index) = self.posts.iter().position(|p| p.id == patch.id) else {
            return Transition::Rejected(Rejection::UnknownPost(patch.id));
        };
        let current = &self.posts[index];

        let mut patch = patch.clone();
        let mut held_vote = None;
        if vote_in_flight
            && let Some(incoming) = patch.vote_count
            && incoming < current.vote_count
        {
            patch.vote_count = None;
            held_vote = Some(incoming);
        }

        let merged = patch.overlay(current);
        // A vote count that was applied supersedes anything held earlier.
        let supersedes_held = patch.vote_count.is_some() && self.held_votes.contains_key(&patch.id);
        if merged == *current && held_vote.is_none() && !supersedes_held {
            return Transition::Unchanged;
        }

        let mut next = self.clone();
        next.posts[index] = merged;
        match held_vote {
            Some(votes) => {
                next.held_votes.insert(patch.id, votes);
            }
            None if supersedes_held => {
                next.held_votes.remove(&patch.id);
            }
            None => {}
        }
        Transition::Changed(next)
    }

    fn insert_comments(&self, comments: &[Comment]) -> Transition {
        let mut next: Option<FeedSnapshot> = None;

        for comment in comments {
            let state = next.as_ref().unwrap_or(self);
            let loaded = state.post(comment.post_id).is_some();
            let target = if loaded {
                state.comments.get(&comment.post_id)
            } else {
                state.held_comments.get(&comment.post_id)
            };
            if target.is_some_and(|list| list.iter().any(|c| c.id == comment.id)) {
                continue;
            }

            let state = next.get_or_insert_with(|| self.clone());
            let list = if loaded {
                state.comments.entry(comment.post_id).or_default()
            } else {
                state.held_comments.entry(comment.post_id).or_default()
            };
            insert_sorted(list, comment);
        }

        match next {
            Some(state) => Transition::Changed(state),
            None => Transition::Unchanged,
        }
    }

    fn adjust_vote(&self, post_id: PostId, delta: i64) -> Transition {
        let Some(index) = self.posts.iter().position(|p| p.id == post_id) else {
            return Transition::Rejected(Rejection::UnknownPost(post_id));
        };
        let current = self.posts[index].vote_count;
        let adjusted = apply_delta(current, delta);
        if adjusted == current {
            return Transition::Unchanged;
        }

        let mut next = self.clone();
        next.posts[index].vote_count = adjusted;
        Transition::Changed(next)
    }

    fn settle_vote(&self, post_id: PostId, committed: bool) -> Transition {
        let Some(index) = self.posts.iter().position(|p| p.id == post_id) else {
            return Transition::Rejected(Rejection::UnknownPost(post_id));
        };

        let mut next = self.clone();
        let held = next.held_votes.remove(&post_id);
        if !committed {
            let post = &mut next.posts[index];
            post.vote_count = apply_delta(post.vote_count, -1);
            if let Some(votes) = held {
                post.vote_count = votes;
            }
        }

        if next == *self {
            Transition::Unchanged
        } else {
            Transition::Changed(next)
        }
    }
}

fn apply_delta(count: u64, delta: i64) -> u64 {
    if delta >= 0 {
        count.saturating_add(delta.unsigned_abs())
    } else {
        count.saturating_sub(delta.unsigned_abs())
    }
}

/// Insert keeping `(created_at, id)` order; ids already present are ignored.
fn insert_sorted(list: &mut Vec<Comment>, comment: &Comment) {
    if list.iter().any(|c| c.id == comment.id) {
        return;
    }
    let key = comment.order_key();
    let at = list.partition_point(|c| c.order_key() < key);
    list.insert(at, comment.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommentId, UserId};
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn post(id: i64, votes: u64) -> Post {
        Post {
            id: PostId(id),
            created_at: at(id),
            title: Some(format!("post {}", id)),
            image_ref: format!("https://cdn/{}.png", id),
            author_id: UserId::from("author"),
            vote_count: votes,
        }
    }

    fn comment(id: i64, post_id: i64, secs: i64) -> Comment {
        Comment {
            id: CommentId(id),
            post_id: PostId(post_id),
            content: format!("comment {}", id),
            created_at: at(secs),
            author_id: UserId::from("commenter"),
            author_display_name: Some("commenter".to_string()),
        }
    }

    fn changed(transition: Transition) -> FeedSnapshot {
        match transition {
            Transition::Changed(state) => state,
            other => panic!("expected Changed, got {:?}", other),
        }
    }

    fn loaded(posts: Vec<Post>) -> FeedSnapshot {
        changed(FeedSnapshot::new().reduce(&StoreEvent::ReplaceAll { posts }))
    }

    #[test]
    fn test_comments_render_in_timestamp_order() {
        let mut state = loaded(vec![post(1, 0)]);
        for (id, secs) in [(20, 2), (10, 1), (30, 3)] {
            state = changed(state.reduce(&StoreEvent::AppendComment {
                comment: comment(id, 1, secs),
            }));
        }
        let ids: Vec<_> = state.comments(PostId(1)).iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_timestamp_ties_break_by_id() {
        let state = loaded(vec![post(1, 0)]);
        let state = changed(state.reduce(&StoreEvent::MergeComments {
            post_id: PostId(1),
            comments: vec![comment(9, 1, 5), comment(4, 1, 5)],
        }));
        let ids: Vec<_> = state.comments(PostId(1)).iter().map(|c| c.id.0).collect();
        assert_eq!(ids, vec![4, 9]);
    }

    #[test]
    fn test_duplicate_comment_is_noop() {
        let state = loaded(vec![post(1, 0)]);
        let state = changed(state.reduce(&StoreEvent::AppendComment {
            comment: comment(1, 1, 1),
        }));
        assert_eq!(
            state.reduce(&StoreEvent::MergeComments {
                post_id: PostId(1),
                comments: vec![comment(1, 1, 1)],
            }),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_mismatched_batch_rejected() {
        let state = loaded(vec![post(1, 0)]);
        assert_eq!(
            state.reduce(&StoreEvent::MergeComments {
                post_id: PostId(1),
                comments: vec![comment(1, 2, 1)],
            }),
            Transition::Rejected(Rejection::MismatchedPost {
                expected: PostId(1),
                found: PostId(2),
            })
        );
    }

    #[test]
    fn test_orphan_comment_held_until_post_loads() {
        let state = loaded(vec![post(1, 0)]);
        let state = changed(state.reduce(&StoreEvent::AppendComment {
            comment: comment(5, 2, 1),
        }));
        assert!(state.comments(PostId(2)).is_empty());
        assert_eq!(state.held_comment_count(), 1);
        assert_eq!(state.comment_count(), 0);

        let state = changed(state.reduce(&StoreEvent::ReplaceAll {
            posts: vec![post(2, 0), post(1, 0)],
        }));
        assert_eq!(state.held_comment_count(), 0);
        assert_eq!(state.comments(PostId(2)).len(), 1);
    }

    #[test]
    fn test_replace_all_drops_comments_of_missing_posts() {
        let state = loaded(vec![post(1, 0), post(2, 0)]);
        let state = changed(state.reduce(&StoreEvent::AppendComment {
            comment: comment(1, 2, 1),
        }));
        let state = changed(state.reduce(&StoreEvent::ReplaceAll {
            posts: vec![post(1, 0)],
        }));
        assert!(state.comments(PostId(2)).is_empty());
        assert_eq!(state.comment_count(), 0);
    }

    #[test]
    fn test_replace_all_dedups_posts() {
        let state = loaded(vec![post(1, 0), post(1, 3)]);
        assert_eq!(state.post_count(), 1);
        assert_eq!(state.post(PostId(1)).unwrap().vote_count, 0);
    }

    #[test]
    fn test_merge_post_rejects_unknown() {
        let state = loaded(vec![post(1, 0)]);
        assert_eq!(
            state.reduce(&StoreEvent::MergePost {
                patch: PostPatch::votes(PostId(2), 3),
                vote_in_flight: false,
            }),
            Transition::Rejected(Rejection::UnknownPost(PostId(2)))
        );
    }

    #[test]
    fn test_merge_post_overlays_fields() {
        let state = loaded(vec![post(1, 5)]);
        let state = changed(state.reduce(&StoreEvent::MergePost {
            patch: PostPatch {
                id: PostId(1),
                title: Some("renamed".to_string()),
                vote_count: Some(7),
                ..PostPatch::default()
            },
            vote_in_flight: false,
        }));
        let merged = state.post(PostId(1)).unwrap();
        assert_eq!(merged.title.as_deref(), Some("renamed"));
        assert_eq!(merged.vote_count, 7);
        assert_eq!(merged.image_ref, "https://cdn/1.png");
    }

    #[test]
    fn test_redelivered_patch_is_unchanged() {
        let state = loaded(vec![post(1, 5)]);
        assert_eq!(
            state.reduce(&StoreEvent::MergePost {
                patch: PostPatch::votes(PostId(1), 5),
                vote_in_flight: false,
            }),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_stale_vote_held_while_in_flight() {
        let state = loaded(vec![post(1, 5)]);
        let state = changed(state.reduce(&StoreEvent::AdjustVote {
            post_id: PostId(1),
            delta: 1,
        }));
        let state = changed(state.reduce(&StoreEvent::MergePost {
            patch: PostPatch::votes(PostId(1), 5),
            vote_in_flight: true,
        }));
        assert_eq!(state.post(PostId(1)).unwrap().vote_count, 6);
        assert_eq!(state.held_vote(PostId(1)), Some(5));

        // Commit discards the stale snapshot.
        let committed = changed(state.reduce(&StoreEvent::SettleVote {
            post_id: PostId(1),
            committed: true,
        }));
        assert_eq!(committed.post(PostId(1)).unwrap().vote_count, 6);
        assert_eq!(committed.held_vote(PostId(1)), None);

        // Failure rolls back and applies the held value.
        let failed = changed(state.reduce(&StoreEvent::SettleVote {
            post_id: PostId(1),
            committed: false,
        }));
        assert_eq!(failed.post(PostId(1)).unwrap().vote_count, 5);
    }

    #[test]
    fn test_newer_feed_vote_replaces_held_value() {
        let state = loaded(vec![post(1, 6)]);
        let state = changed(state.reduce(&StoreEvent::MergePost {
            patch: PostPatch::votes(PostId(1), 5),
            vote_in_flight: true,
        }));
        let state = changed(state.reduce(&StoreEvent::MergePost {
            patch: PostPatch::votes(PostId(1), 6),
            vote_in_flight: true,
        }));
        assert_eq!(state.held_vote(PostId(1)), None);
        assert_eq!(state.post(PostId(1)).unwrap().vote_count, 6);
    }

    #[test]
    fn test_unguarded_stale_vote_applies() {
        let state = loaded(vec![post(1, 6)]);
        let state = changed(state.reduce(&StoreEvent::MergePost {
            patch: PostPatch::votes(PostId(1), 5),
            vote_in_flight: false,
        }));
        assert_eq!(state.post(PostId(1)).unwrap().vote_count, 5);
    }

    #[test]
    fn test_higher_feed_vote_applies_while_in_flight() {
        let state = loaded(vec![post(1, 6)]);
        let state = changed(state.reduce(&StoreEvent::MergePost {
            patch: PostPatch::votes(PostId(1), 8),
            vote_in_flight: true,
        }));
        assert_eq!(state.post(PostId(1)).unwrap().vote_count, 8);
        assert_eq!(state.held_vote(PostId(1)), None);
    }

    #[test]
    fn test_vote_floor_at_zero() {
        let state = loaded(vec![post(1, 0)]);
        assert_eq!(
            state.reduce(&StoreEvent::AdjustVote {
                post_id: PostId(1),
                delta: -1,
            }),
            Transition::Unchanged
        );
    }

    proptest! {
        #[test]
        fn comment_ids_stay_unique(
            arrivals in prop::collection::vec((0i64..20, 0i64..50), 1..80)
        ) {
            let mut state = loaded(vec![post(1, 0)]);
            for (id, secs) in &arrivals {
                if let Transition::Changed(next) = state.reduce(&StoreEvent::AppendComment {
                    comment: comment(*id, 1, *secs),
                }) {
                    state = next;
                }
            }

            let list = state.comments(PostId(1));
            let unique: HashSet<_> = list.iter().map(|c| c.id).collect();
            prop_assert_eq!(unique.len(), list.len());

            let distinct: HashSet<_> = arrivals.iter().map(|(id, _)| *id).collect();
            prop_assert_eq!(list.len(), distinct.len());
        }

        #[test]
        fn comment_order_independent_of_arrival(
            mut batch in prop::collection::vec((0i64..1000, 0i64..30), 1..40)
        ) {
            batch.sort_by_key(|(id, _)| *id);
            batch.dedup_by_key(|(id, _)| *id);
            let comments: Vec<_> = batch.iter().map(|(id, secs)| comment(*id, 1, *secs)).collect();

            let forward = comments.iter().fold(loaded(vec![post(1, 0)]), |state, c| {
                changed(state.reduce(&StoreEvent::AppendComment { comment: c.clone() }))
            });
            let backward = comments.iter().rev().fold(loaded(vec![post(1, 0)]), |state, c| {
                changed(state.reduce(&StoreEvent::AppendComment { comment: c.clone() }))
            });

            prop_assert_eq!(forward.comments(PostId(1)), backward.comments(PostId(1)));
            let keys: Vec<_> = forward.comments(PostId(1)).iter().map(Comment::order_key).collect();
            let mut sorted = keys.clone();
            sorted.sort();
            prop_assert_eq!(keys, sorted);
        }

        #[test]
        fn failed_vote_restores_count(start in 0u64..1000) {
            let state = loaded(vec![post(1, start)]);
            let state = changed(state.reduce(&StoreEvent::AdjustVote { post_id: PostId(1), delta: 1 }));
            let state = changed(state.reduce(&StoreEvent::SettleVote { post_id: PostId(1), committed: false }));
            prop_assert_eq!(state.post(PostId(1)).unwrap().vote_count, start);
        }
    }
}
