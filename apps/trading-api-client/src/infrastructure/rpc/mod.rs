//! Multiplexed RPC Core
//!
//! One reader task and one writer task per connection; callers wait on
//! private sinks registered before their frame is written.

/// Connection facade, lifecycle and options.
pub mod connection;

/// Inbound frame routing.
pub mod reader;

/// Pending request and subscription tables.
pub mod registry;

/// Caller-side subscription handle.
pub mod subscription;

mod writer;

pub use connection::{Connection, ConnectionOptions, ConnectionState, DecodeErrorPolicy};
pub use reader::{Route, route_frame};
pub use registry::{Delivery, PendingRequests, Promotion, SubscriptionRegistry, SubscriptionSink};
pub use subscription::Subscription;
