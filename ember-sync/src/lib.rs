//! Ember's block download pipeline.
//!
//! Given a pool of remote peers speaking a header/body exchange protocol,
//! the pipeline retrieves the canonical header chain and block bodies,
//! validates them, reassembles them into contiguous height order, and
//! hands them to the embedding application's importer.
//!
//! The pipeline is built from two long-lived workers around one piece of
//! shared state:
//!
//!  - the [`ReassemblyQueue`] tracks which part of the future chain is
//!    known, which ranges are in flight, and which prefix is ready to emit;
//!  - the header worker pulls header requests from the queue, spreads them
//!    across idle peers, and feeds validated responses back;
//!  - the body worker does the same for block bodies, throttled by the
//!    importer's free queue space.
//!
//! Everything downstream is reached through the [`DownloadSink`] seam, and
//! everything upstream through the [`PeerPool`](ember_network::PeerPool)
//! and [`PeerHandle`](ember_network::PeerHandle) seams, so the pipeline is
//! generic over its transport, its consensus rules, and its importer.

#![forbid(unsafe_code)]

#[macro_use]
extern crate tracing;

pub mod config;
pub mod downloader;
pub mod queue;

mod latch;

pub use config::Config;
pub use downloader::{BlockDownloader, DownloadSink, HeaderValidator};
pub use queue::{BlocksRequest, HeadersRequest, InvalidHeaders, ReassemblyQueue, SyncQueue};

/// A boxed [`std::error::Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The maximum number of headers or bodies in one request to a peer.
pub const MAX_IN_REQUEST: usize = 192;
