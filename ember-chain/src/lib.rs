//! Core chain data structures for Ember.
//!
//! This crate defines the block types shared by the rest of the node:
//! hashes, heights, headers, and blocks. It deliberately contains no
//! networking or validation logic.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod block;
