//! The reassembly queue: the shared state between the two download
//! workers.
//!
//! The queue tracks a sparsely-known segment of the future chain. It hands
//! out gap-filling header requests, absorbs responses (which may arrive
//! out of order, duplicated, or from different forks), and emits the
//! prefix that has become contiguous with the **tip**: the highest header
//! whose ancestry is fully assembled. Headers that do not yet connect are
//! buffered as **islands** until the gap below them fills.
//!
//! Bodies follow the same discipline one stage later: only headers that
//! have already been emitted are eligible for body requests, and blocks
//! are emitted in strictly ascending height order.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::time::Instant;

use ember_chain::block::{Block, Hash, Height};
use ember_network::{HeaderWrapper, PeerId};


/// How long a handed-out header range stays reserved before the queue
/// offers it to another peer.
///
/// ## Correctness
///
/// Must comfortably exceed the header worker's latch timeout, or every
/// range would be reissued before its first response can arrive.
pub(crate) const REQUEST_RESERVATION_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a reservation record stays matchable after it was issued.
///
/// Records outlive their reservation so that a late response from a slow
/// peer still matches its request instead of looking unsolicited.
pub(crate) const REQUEST_RESERVATION_GC_TIMEOUT: Duration = Duration::from_secs(20);

/// A request for a run of headers, emitted by
/// [`SyncQueue::request_headers`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeadersRequest {
    /// Request `count` headers by block number.
    ByNumber {
        /// The number of the first header in the run.
        start: Height,
        /// How many headers to return.
        count: u32,
        /// Walk the chain towards the genesis block instead of away from
        /// it.
        reverse: bool,
    },

    /// Request a skip-list of headers anchored at a known hash.
    ByHash {
        /// The hash of the first header in the run.
        anchor: Hash,
        /// How many headers to return.
        count: u32,
        /// The number of blocks between consecutive headers.
        step: u32,
        /// Walk the chain towards the genesis block instead of away from
        /// it.
        reverse: bool,
    },
}

impl HeadersRequest {
    /// How many headers this request asks for.
    pub fn count(&self) -> u32 {
        match self {
            HeadersRequest::ByNumber { count, .. } => *count,
            HeadersRequest::ByHash { count, .. } => *count,
        }
    }

    /// The expected number difference between consecutive response
    /// headers.
    pub fn step(&self) -> u32 {
        match self {
            HeadersRequest::ByNumber { .. } => 1,
            HeadersRequest::ByHash { step, .. } => (*step).max(1),
        }
    }

    /// Whether the response runs towards the genesis block.
    pub fn reverse(&self) -> bool {
        match self {
            HeadersRequest::ByNumber { reverse, .. } => *reverse,
            HeadersRequest::ByHash { reverse, .. } => *reverse,
        }
    }

    /// Whether `first` could be the first response header for this
    /// request.
    fn matches_first(&self, first: &HeaderWrapper) -> bool {
        match self {
            HeadersRequest::ByNumber { start, .. } => first.number() == *start,
            HeadersRequest::ByHash { anchor, .. } => first.hash() == *anchor,
        }
    }

    /// The inclusive height range this request covers, when it is known
    /// without resolving a hash.
    fn height_range(&self) -> Option<(u64, u64)> {
        match self {
            HeadersRequest::ByNumber {
                start,
                count,
                reverse: false,
            } => Some((
                start.0,
                start.0.saturating_add(count.saturating_sub(1) as u64),
            )),
            HeadersRequest::ByNumber {
                start,
                count,
                reverse: true,
            } => Some((start.0.saturating_sub(count.saturating_sub(1) as u64), start.0)),
            HeadersRequest::ByHash { .. } => None,
        }
    }

    /// Check a response batch against this request: the numbers must
    /// advance by exactly [`step`](Self::step) in the requested direction,
    /// and for dense runs every header must link to its neighbour's hash.
    ///
    /// The batch must be in wire order and non-empty.
    fn validate_batch(&self, batch: &[HeaderWrapper]) -> Result<(), InvalidHeaders> {
        let from = batch[0].from();
        let step = self.step();
        let stride = if self.reverse() {
            -(step as i64)
        } else {
            step as i64
        };

        for pair in batch.windows(2) {
            if (pair[0].number() + stride) != Some(pair[1].number()) {
                return Err(InvalidHeaders::NonMonotonic {
                    number: pair[1].number(),
                    expected_step: step,
                    from,
                });
            }

            if step == 1 {
                let (child, parent) = if self.reverse() {
                    (&pair[0], &pair[1])
                } else {
                    (&pair[1], &pair[0])
                };
                if child.parent_hash() != parent.hash() {
                    return Err(InvalidHeaders::BrokenParentLink {
                        number: child.number(),
                        from,
                    });
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for HeadersRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeadersRequest::ByNumber {
                start,
                count,
                reverse,
            } => write!(
                f,
                "headers from #{} (count {count}{})",
                start.0,
                if *reverse { ", reverse" } else { "" },
            ),
            HeadersRequest::ByHash {
                anchor,
                count,
                step,
                reverse,
            } => write!(
                f,
                "headers anchored at {anchor} (count {count}, step {step}{})",
                if *reverse { ", reverse" } else { "" },
            ),
        }
    }
}

/// A request for the bodies of an ordered run of headers, emitted by
/// [`SyncQueue::request_blocks`].
#[derive(Clone, Debug, Default)]
pub struct BlocksRequest {
    headers: Vec<HeaderWrapper>,
}

impl BlocksRequest {
    /// The headers whose bodies are wanted, in ascending height order.
    pub fn headers(&self) -> &[HeaderWrapper] {
        &self.headers
    }

    /// How many bodies this request asks for.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Returns true when no body work is available.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Shard this request into requests of at most `max` headers,
    /// preserving order. An empty request splits into no shards.
    pub fn split(self, max: usize) -> Vec<BlocksRequest> {
        self.headers
            .chunks(max.max(1))
            .map(|chunk| BlocksRequest {
                headers: chunk.to_vec(),
            })
            .collect()
    }
}

/// A structurally invalid header response, attributed to the peer that
/// sent it.
///
/// The whole batch is discarded when any of these is returned, and the
/// caller is expected to drop the attributed peer.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum InvalidHeaders {
    /// A header does not link to the hash of the header below it.
    #[error("header #{} from peer {from} does not link to its predecessor", number.0)]
    BrokenParentLink {
        /// The number of the offending header.
        number: Height,
        /// The peer the batch was received from.
        from: PeerId,
    },

    /// Header numbers do not advance by the requested stride.
    #[error("header #{} from peer {from} breaks the expected stride of {expected_step}", number.0)]
    NonMonotonic {
        /// The number of the offending header.
        number: Height,
        /// The stride the matched request asked for.
        expected_step: u32,
        /// The peer the batch was received from.
        from: PeerId,
    },

    /// The batch matches no request this queue has handed out.
    #[error("headers starting at #{} from peer {from} match no outstanding request", start.0)]
    Unsolicited {
        /// The number of the first header in the batch.
        start: Height,
        /// The peer the batch was received from.
        from: PeerId,
    },
}

/// The reassembly buffer between the download workers and the importer.
///
/// All four operations are short and non-blocking; the queue is designed
/// to live behind a mutex shared by both workers and their completion
/// callbacks.
pub trait SyncQueue: Send + 'static {
    /// Returns up to `max_requests` gap-filling header requests of at most
    /// `max_per_request` headers each.
    ///
    /// Returns `None` exactly when the header chain is complete. Returns
    /// `Some(vec![])` when no work is issuable right now, either because
    /// every missing range is reserved in flight or because
    /// `total_pending` buffered headers are already held; the caller
    /// should retry after its latch wait.
    fn request_headers(
        &mut self,
        max_per_request: usize,
        max_requests: usize,
        total_pending: usize,
    ) -> Option<Vec<HeadersRequest>>;

    /// Absorb a batch of received headers, in wire order, all from one
    /// peer.
    ///
    /// Returns the run of headers newly made contiguous with the tip
    /// (often empty), or an attributed error if the batch is structurally
    /// invalid or matches no outstanding request. A rejected batch leaves
    /// the queue unchanged.
    fn add_headers(&mut self, batch: Vec<HeaderWrapper>)
        -> Result<Vec<HeaderWrapper>, InvalidHeaders>;

    /// Returns a request covering up to `max` emitted headers whose bodies
    /// are still missing, in ascending height order.
    fn request_blocks(&mut self, max: usize) -> BlocksRequest;

    /// Absorb received blocks, keyed by their header hash, and return the
    /// run of blocks newly made contiguous in ascending height order.
    ///
    /// Blocks for unknown headers and duplicate bodies are ignored.
    fn add_blocks(&mut self, blocks: Vec<Block>) -> Vec<Arc<Block>>;
}

/// A header range handed out to the header worker.
struct Reservation {
    request: HeadersRequest,
    issued_at: Instant,
    /// Cleared once a response (valid or not) has matched this record, so
    /// the range stops blocking the scheduler. The record itself stays
    /// matchable for late duplicates until it is garbage collected.
    open: bool,
}

/// The production [`SyncQueue`] implementation.
pub struct ReassemblyQueue {
    /// The hash of the highest header whose ancestry is fully assembled.
    tip_hash: Hash,
    tip_height: u64,

    /// The height at which the header chain is complete, when known.
    target: Option<u64>,

    /// Whether emitted headers are retained for body download.
    fetch_bodies: bool,

    /// Received headers above the tip, keyed by height then hash.
    /// Everything in here is either the next contiguous run or an island.
    candidates: BTreeMap<u64, HashMap<Hash, HeaderWrapper>>,
    /// Total header count across `candidates`.
    buffered: usize,

    /// Header ranges handed out and not yet garbage collected, keyed by
    /// the lowest height they cover.
    reservations: BTreeMap<u64, Reservation>,

    /// Emitted headers whose blocks have not yet been emitted.
    awaiting_bodies: BTreeMap<u64, HeaderWrapper>,
    /// Hash index over `awaiting_bodies`.
    body_wanted: HashMap<Hash, u64>,

    /// Received blocks waiting for the run below them to arrive.
    blocks: BTreeMap<u64, Arc<Block>>,
    last_emitted_block: u64,
}

impl ReassemblyQueue {
    /// A queue starting from the local chain head.
    ///
    /// `target` is the height at which the header chain is known to end
    /// (typically from the peer handshake); without it the queue follows
    /// the chain indefinitely and never reports completion.
    pub fn new(
        tip_hash: Hash,
        tip_height: Height,
        target: Option<Height>,
        fetch_bodies: bool,
    ) -> Self {
        Self {
            tip_hash,
            tip_height: tip_height.0,
            target: target.map(|height| height.0),
            fetch_bodies,
            candidates: BTreeMap::new(),
            buffered: 0,
            reservations: BTreeMap::new(),
            awaiting_bodies: BTreeMap::new(),
            body_wanted: HashMap::new(),
            blocks: BTreeMap::new(),
            last_emitted_block: tip_height.0,
        }
    }

    /// The height of the last contiguously-assembled header.
    pub fn tip_height(&self) -> Height {
        Height(self.tip_height)
    }

    /// How many downloaded headers the queue is currently holding: islands,
    /// not-yet-emitted runs, and headers awaiting their bodies.
    pub fn pending_header_count(&self) -> usize {
        self.buffered + self.awaiting_bodies.len()
    }

    fn headers_complete(&self) -> bool {
        self.target
            .map(|target| self.tip_height >= target)
            .unwrap_or(false)
    }

    /// Drop reservation records that can no longer be useful: ranges the
    /// tip has passed, and records old enough that no response can still
    /// be in flight for them.
    fn gc_reservations(&mut self, now: Instant) {
        let tip_height = self.tip_height;
        self.reservations.retain(|_, reservation| {
            if now.saturating_duration_since(reservation.issued_at)
                >= REQUEST_RESERVATION_GC_TIMEOUT
            {
                return false;
            }
            match reservation.request.height_range() {
                Some((_, end)) => end > tip_height,
                None => true,
            }
        });
    }

    /// The inclusive height intervals the scheduler must not re-request:
    /// buffered candidates and live reservations, merged and sorted.
    fn blocked_intervals(&self, now: Instant) -> Vec<(u64, u64)> {
        let mut blocked: Vec<(u64, u64)> = Vec::new();

        for reservation in self.reservations.values() {
            if !reservation.open {
                continue;
            }
            if now.saturating_duration_since(reservation.issued_at)
                >= REQUEST_RESERVATION_TIMEOUT
            {
                continue;
            }
            if let Some(range) = reservation.request.height_range() {
                blocked.push(range);
            }
        }

        for &height in self.candidates.keys() {
            match blocked.last_mut() {
                Some((_, end)) if *end + 1 == height => *end = height,
                _ => blocked.push((height, height)),
            }
        }

        blocked.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::new();
        for (start, end) in blocked {
            match merged.last_mut() {
                Some((_, merged_end)) if start <= merged_end.saturating_add(1) => {
                    *merged_end = (*merged_end).max(end);
                }
                _ => merged.push((start, end)),
            }
        }

        merged
    }

    /// Advance the tip through every candidate that now links to it,
    /// returning the emitted run.
    fn assemble(&mut self) -> Vec<HeaderWrapper> {
        let mut emitted = Vec::new();

        loop {
            let next = self.tip_height + 1;
            let Some(level) = self.candidates.get(&next) else {
                break;
            };
            let Some(wrapper) = level
                .values()
                .find(|wrapper| wrapper.parent_hash() == self.tip_hash)
                .cloned()
            else {
                break;
            };

            // The chosen header is anchored to the tip; sibling candidates
            // at this height are islands from other branches and can never
            // connect any more.
            let level_size = self
                .candidates
                .remove(&next)
                .map(|level| level.len())
                .unwrap_or_default();
            self.buffered -= level_size;
            if level_size > 1 {
                metrics::counter!("sync.queue.discarded.header.count")
                    .increment(level_size as u64 - 1);
            }

            self.tip_hash = wrapper.hash();
            self.tip_height = next;

            if self.fetch_bodies {
                self.body_wanted.insert(wrapper.hash(), next);
                self.awaiting_bodies.insert(next, wrapper.clone());
            }

            emitted.push(wrapper);
        }

        // Whatever is left at the level right above the tip does not link
        // to it, and the tip is final within a pipeline run: those
        // candidates can never connect, and holding them would make the
        // scheduler treat the height as covered.
        if let Some(level) = self.candidates.remove(&(self.tip_height + 1)) {
            self.buffered -= level.len();
            metrics::counter!("sync.queue.discarded.header.count").increment(level.len() as u64);
        }

        metrics::gauge!("sync.queue.tip.height").set(self.tip_height as f64);
        metrics::gauge!("sync.queue.buffered.header.count").set(self.buffered as f64);

        emitted
    }
}

impl SyncQueue for ReassemblyQueue {
    fn request_headers(
        &mut self,
        max_per_request: usize,
        max_requests: usize,
        total_pending: usize,
    ) -> Option<Vec<HeadersRequest>> {
        if self.headers_complete() {
            return None;
        }
        if self.pending_header_count() >= total_pending {
            return Some(Vec::new());
        }

        let now = Instant::now();
        self.gc_reservations(now);

        let budget = total_pending - self.pending_header_count();
        let horizon = self.target.unwrap_or(Height::MAX.0);

        let mut requests = Vec::new();
        let mut issued = 0usize;
        let mut cursor = self.tip_height + 1;
        let mut blocked = self.blocked_intervals(now).into_iter().peekable();

        while requests.len() < max_requests && issued < budget && cursor <= horizon {
            // Skip intervals the cursor has reached or passed.
            while let Some(&(start, end)) = blocked.peek() {
                if end < cursor {
                    blocked.next();
                } else if start <= cursor {
                    cursor = end + 1;
                    blocked.next();
                } else {
                    break;
                }
            }
            if cursor > horizon {
                break;
            }

            let gap_end = blocked
                .peek()
                .map(|&(start, _)| start - 1)
                .unwrap_or(u64::MAX)
                .min(horizon);
            let len = (budget - issued)
                .min(max_per_request)
                .min((gap_end - cursor + 1).try_into().unwrap_or(usize::MAX));

            let request = HeadersRequest::ByNumber {
                start: Height(cursor),
                count: len as u32,
                reverse: false,
            };
            self.reservations.insert(
                cursor,
                Reservation {
                    request: request.clone(),
                    issued_at: now,
                    open: true,
                },
            );
            requests.push(request);

            issued += len;
            cursor += len as u64;
        }

        Some(requests)
    }

    fn add_headers(
        &mut self,
        batch: Vec<HeaderWrapper>,
    ) -> Result<Vec<HeaderWrapper>, InvalidHeaders> {
        let Some(first) = batch.first() else {
            return Ok(Vec::new());
        };

        let matched = self
            .reservations
            .iter_mut()
            .map(|(_, reservation)| reservation)
            .find(|reservation| reservation.request.matches_first(first));
        let Some(reservation) = matched else {
            return Err(InvalidHeaders::Unsolicited {
                start: first.number(),
                from: first.from(),
            });
        };

        // The range stops blocking the scheduler whether or not the batch
        // turns out to be valid: a rejected range must be reissued
        // promptly, and a fulfilled one is covered by the buffer.
        reservation.open = false;
        let request = reservation.request.clone();

        request.validate_batch(&batch)?;

        let mut batch = batch;
        if request.reverse() {
            batch.reverse();
        }

        for wrapper in batch {
            let number = wrapper.number().0;
            if number <= self.tip_height {
                // Already assembled; duplicates are expected when a range
                // was served by more than one peer.
                continue;
            }
            if self.target.map_or(false, |target| number > target) {
                continue;
            }

            let level = self.candidates.entry(number).or_default();
            if level.insert(wrapper.hash(), wrapper).is_none() {
                self.buffered += 1;
            }
        }

        Ok(self.assemble())
    }

    fn request_blocks(&mut self, max: usize) -> BlocksRequest {
        let mut headers = Vec::new();

        for (number, wrapper) in &self.awaiting_bodies {
            if headers.len() >= max {
                break;
            }
            if self.blocks.contains_key(number) {
                continue;
            }
            headers.push(wrapper.clone());
        }

        BlocksRequest { headers }
    }

    fn add_blocks(&mut self, blocks: Vec<Block>) -> Vec<Arc<Block>> {
        for block in blocks {
            let Some(&number) = self.body_wanted.get(&block.hash()) else {
                // A body nothing is waiting for: either a duplicate of an
                // emitted block or an answer we never asked for.
                continue;
            };
            self.blocks.entry(number).or_insert_with(|| Arc::new(block));
        }

        let mut emitted = Vec::new();
        while let Some(block) = self.blocks.remove(&(self.last_emitted_block + 1)) {
            self.last_emitted_block += 1;

            if let Some(wrapper) = self.awaiting_bodies.remove(&self.last_emitted_block) {
                self.body_wanted.remove(&wrapper.hash());
            }

            emitted.push(block);
        }

        emitted
    }
}
