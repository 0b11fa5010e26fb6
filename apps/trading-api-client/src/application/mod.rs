//! Application Layer - Port definitions and the streaming abstraction.
//!
//! This layer contains the interfaces the connection core is written
//! against and the `Streamer` contract shared by every push source.

/// Port interfaces for transports and codecs.
pub mod ports;

/// Pull/push streaming abstraction.
pub mod streamer;
