//! VolStream Environment Abstraction Layer
//!
//! This crate isolates everything the clustering engine consumes from, or
//! hands to, its collaborators so the same control loop runs in
//! **Production** (tokio, real tracking feed) and **Simulation** (virtual
//! clock, seeded oracle).
//!
//! Intercepted I/O:
//! - Time (`now()`, `sleep()`)
//! - Tracking input (`UpdateFeed::recv()`): entity motion, viewer cameras,
//!   per-viewer bandwidth estimates
//! - Decision output (`DecisionSink::publish()`): serialized cluster and
//!   quality decisions for the encoder/transport layer
//!
//! # Example
//!
//! ```ignore
//! use volstream_env::{StreamContext, UpdateFeed};
//!
//! async fn ingest_loop<Ctx: StreamContext, Feed: UpdateFeed>(ctx: &Ctx, feed: &Feed) {
//!     loop {
//!         tokio::select! {
//!             update = feed.recv() => apply(update),
//!             _ = ctx.sleep(Duration::from_millis(33)) => tick(),
//!         }
//!     }
//! }
//! ```

mod channel;
mod context;
mod error;
mod feed;
mod tokio_impl;
mod types;

pub use channel::{ChannelFeed, ChannelSink, FeedHandle};
pub use context::StreamContext;
pub use error::EnvError;
pub use feed::{DecisionSink, UpdateFeed};
pub use tokio_impl::TokioContext;
pub use types::{
    BandwidthUpdate, DecisionEnvelope, EntityId, EntityUpdate, ProjectionParams,
    TrackingUpdate, ViewerId, ViewerUpdate,
};
