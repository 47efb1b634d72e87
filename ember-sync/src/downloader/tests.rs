//! Tests for the block downloader.


use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use ember_chain::block::Header;
use ember_network::{BlockWrapper, HeaderWrapper};

use super::*;
use crate::BoxError;

/// A validator that accepts every header.
struct AcceptAllValidator;

impl HeaderValidator for AcceptAllValidator {
    fn validate(&self, _header: &Header) -> Result<(), BoxError> {
        Ok(())
    }
}

/// A validator that rejects every header.
struct RejectAllValidator;

impl HeaderValidator for RejectAllValidator {
    fn validate(&self, header: &Header) -> Result<(), BoxError> {
        Err(format!("header #{} failed validation", header.number.0).into())
    }
}

/// A sink that records everything the pipeline emits.
struct RecordingSink {
    headers: Mutex<Vec<HeaderWrapper>>,
    blocks: Mutex<Vec<BlockWrapper>>,
    free_size: AtomicUsize,
    finish_calls: AtomicUsize,
    close_to_tip: AtomicBool,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            headers: Mutex::new(Vec::new()),
            blocks: Mutex::new(Vec::new()),
            free_size: AtomicUsize::new(100_000),
            finish_calls: AtomicUsize::new(0),
            close_to_tip: AtomicBool::new(false),
        })
    }

    fn with_free_size(free: usize) -> Arc<Self> {
        let sink = Self::new();
        sink.free_size.store(free, Ordering::SeqCst);
        sink
    }

    fn header_heights(&self) -> Vec<u64> {
        self.headers
            .lock()
            .expect("thread panicked while holding the recorded headers lock")
            .iter()
            .map(|wrapper| wrapper.number().0)
            .collect()
    }

    fn recorded_headers(&self) -> Vec<HeaderWrapper> {
        self.headers
            .lock()
            .expect("thread panicked while holding the recorded headers lock")
            .clone()
    }

    fn block_heights(&self) -> Vec<u64> {
        self.blocks
            .lock()
            .expect("thread panicked while holding the recorded blocks lock")
            .iter()
            .map(|wrapper| wrapper.height().0)
            .collect()
    }

    fn finish_calls(&self) -> usize {
        self.finish_calls.load(Ordering::SeqCst)
    }
}

impl DownloadSink for RecordingSink {
    fn push_headers(&self, headers: Vec<HeaderWrapper>) {
        self.headers
            .lock()
            .expect("thread panicked while holding the recorded headers lock")
            .extend(headers);
    }

    fn push_blocks(&self, blocks: Vec<BlockWrapper>) {
        self.blocks
            .lock()
            .expect("thread panicked while holding the recorded blocks lock")
            .extend(blocks);
    }

    fn block_queue_free_size(&self) -> usize {
        self.free_size.load(Ordering::SeqCst)
    }

    fn finish_download(&self) {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_close_to_tip(&self) -> bool {
        self.close_to_tip.load(Ordering::SeqCst)
    }
}
