//! Wire layer of the bridge.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (Request, Response, ErrorResponse) and correlation ids
//! - **codec**: JSON wire strings plus length-delimited framing for byte streams
//! - **transport**: One-way `send` seam and its adapters

pub mod codec;
pub mod protocol;
pub mod transport;
