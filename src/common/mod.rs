//! Common types shared across the crate.
//!
//! This module provides foundational types used throughout veles:
//! - Error types for unified error handling
//! - Peer and protocol identifiers
//! - Wire address parsing for the allowlist

pub mod addr;
pub mod error;
pub mod id;

// Re-export commonly used items for convenience
pub use addr::NetAddr;
pub use error::{ResourceError, ResourceKind};
pub use id::{PeerId, ProtocolId};
