//! Domain Layer - Core protocol types and invariants.
//!
//! This layer contains the correlation identifiers, the decoded frame shape,
//! the error taxonomy and the per-subscription state machine. Nothing here
//! performs I/O.

/// Correlation ids, subscription tokens and the id allocator.
pub mod ids;

/// Decoded inbound frames.
pub mod frame;

/// Error taxonomy shared by every layer.
pub mod error;

/// Per-subscription lifecycle state.
pub mod subscription;
