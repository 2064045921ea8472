//! Client-side state reconciliation for the memeboard feed.
//!
//! Keeps an in-memory view of posts, votes, comments and the signed-in
//! profile consistent across bulk fetches, optimistic local mutations and
//! change-feed notifications from every client.
//!
//! ## Features
//!
//! - **Entity store**: immutable snapshots published through a `watch` channel
//! - **Coordinator**: optimistic votes with exact rollback, comment submission,
//!   uploads, at most one in-flight call per action key
//! - **Reconciler**: change-feed subscription with reconnect backoff
//! - **Identity cache**: session and profile resolution guarded by generation
//! - **Clients**: PostgREST/GoTrue/Storage over HTTP, Realtime over WebSocket

pub mod app;
pub mod backend;
mod client;
pub mod coordinator;
mod error;
pub mod identity;
pub mod inflight;
pub mod realtime;
pub mod reconciler;
pub mod state;
pub mod store;
mod types;

#[cfg(test)]
mod testing;

pub use app::FeedApp;
pub use backend::{ChangeEvent, ChangeFeed, ChangeStream, FeedBackend};
pub use client::{DEFAULT_BUCKET, RestClient};
pub use error::{BackendError, FeedError};
pub use identity::IdentityCache;
pub use inflight::{InFlight, InFlightGuard, InFlightKey};
pub use realtime::{DEFAULT_HEARTBEAT, RealtimeClient};
pub use reconciler::{ReconnectPolicy, Subscription, SubscriptionState};
pub use state::{FeedSnapshot, Rejection, StoreEvent, Transition};
pub use store::{Applied, EntityStore};
pub use types::*;
