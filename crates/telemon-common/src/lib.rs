//! Data types shared by every telemon crate: the payloads monitors emit,
//! discovered endpoints, and the identifiers that tie them together.

pub mod pattern;
pub mod types;
