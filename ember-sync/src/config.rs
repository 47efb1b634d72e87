//! Sync configuration section.

use serde::{Deserialize, Serialize};

/// Sync configuration section.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Download the header chain.
    ///
    /// Disabling this runs the pipeline in a bodies-only mode for
    /// embedders that learn about headers through another channel.
    pub headers_download: bool,

    /// Download block bodies for downloaded headers.
    ///
    /// Disabling this runs the pipeline in a headers-only light-sync
    /// mode: only the header sink is fed, and the download completes when
    /// the header chain does.
    pub block_bodies_download: bool,

    /// The maximum number of downloaded headers buffered inside the
    /// pipeline, waiting for their bodies or for a gap below them to fill.
    ///
    /// When the buffer is full the header worker stops requesting, so a
    /// slow importer throttles header download instead of growing memory.
    pub header_queue_limit: usize,

    /// The number of blocks the importer is expected to admit.
    ///
    /// Advisory: the live value comes from
    /// [`DownloadSink::block_queue_free_size`](crate::DownloadSink::block_queue_free_size)
    /// on every body worker iteration.
    pub block_queue_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            headers_download: true,
            block_bodies_download: true,

            // Around fifty full header rounds of lookahead.
            header_queue_limit: 10_000,

            // Enough for a burst of imports without holding whole blocks
            // for too long.
            block_queue_limit: 2_000,
        }
    }
}
