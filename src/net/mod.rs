//! Requests, responses and the network transport.

mod client;
#[cfg(test)]
pub mod mock;
mod types;

pub use client::{HttpNetwork, Network};
pub use types::{Destination, Request, RequestMode, Response};
