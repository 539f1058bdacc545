//! RESP (Redis Serialization Protocol) support.
//!
//! - [`codec`] - Encoder and decoder for RESP2
//! - [`error`] - Error types shared by the whole crate
//! - [`frame`] - Frame types representing RESP data structures

pub mod codec;
/// Error types.
pub mod error;
pub mod frame;
