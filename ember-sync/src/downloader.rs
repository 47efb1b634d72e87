//! The block downloader: the lifecycle owner of the two download workers.
//!
//! The header worker pulls gap-filling requests from the queue and spreads
//! them across idle peers; the body worker does the same for block bodies
//! on headers the queue has already emitted, throttled by the importer's
//! free queue space. Responses are handled on detached completion tasks,
//! and each worker paces itself with a countdown latch: it waits for
//! roughly its dispatched requests to complete, or a short timeout,
//! whichever comes first, so a hung peer can never stall a round.

use std::{
    cmp::{max, min},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};
use tracing::Instrument;

use ember_chain::block::{Block, Header};
use ember_network::{
    BlockWrapper, BodiesResponseFuture, HeaderWrapper, HeadersResponseFuture, PeerHandle, PeerId,
    PeerPool,
};

use crate::{
    latch::Latch,
    queue::{BlocksRequest, HeadersRequest, SyncQueue},
    BoxError, Config, MAX_IN_REQUEST,
};

#[cfg(test)]
mod tests;

/// The maximum number of header requests pulled from the queue per round.
const MAX_HEADER_REQUESTS_PER_ROUND: usize = 128;

/// How many missing bodies the body worker asks the queue for at once,
/// before sharding the result into per-peer requests.
const BULK_BODY_REQUEST_LIMIT: usize = 16 * 1024;

/// The maximum number of body request shards dispatched per round, as a
/// multiple of [`MAX_IN_REQUEST`].
const BODY_ROUND_REQUEST_MULTIPLIER: usize = 32;

/// A single remaining shard of at most this many headers is treated as the
/// fresh tip of the chain, and its bodies are also requested directly from
/// the peers that delivered the headers.
const FRESH_TIP_SHARD_LIMIT: usize = 3;

/// How long the header worker waits for its latch while syncing.
///
/// ## Correctness
///
/// If this timeout is removed (or set too high), a round whose peers all
/// went silent stalls header download for the whole wait.
///
/// If this timeout is set too low, the worker spins against a queue whose
/// ranges are all reserved in flight.
const HEADERS_LATCH_TIMEOUT: Duration = Duration::from_millis(500);

/// How long the header worker waits for its latch once the embedder
/// reports the node is close to the network tip.
///
/// In the post-sync steady state new headers appear at the block interval,
/// so polling faster than this only produces empty requests.
const STEADY_STATE_HEADERS_LATCH_TIMEOUT: Duration = Duration::from_millis(10_000);

/// How long the body worker waits for its latch.
///
/// Shorter than the header wait: bodies are the import bottleneck, and a
/// timed-out body round reissues its missing bodies to other peers.
const BODIES_LATCH_TIMEOUT: Duration = Duration::from_millis(200);

/// The consensus seam: per-header validation injected by the embedder.
///
/// The header worker rejects a whole response batch on the first failing
/// header and drops the peer that sent it.
pub trait HeaderValidator: Send + Sync + 'static {
    /// Check `header` against the consensus rules that can be checked
    /// statelessly.
    fn validate(&self, header: &Header) -> Result<(), BoxError>;
}

/// The downstream seam: the embedding application's importer.
///
/// The push downcalls run on completion tasks while the queue lock is
/// held, so they must be fast or hand off internally.
pub trait DownloadSink: Send + Sync + 'static {
    /// Called with each run of headers newly contiguous with the tip, in
    /// strictly ascending height order, without gaps or duplicates.
    fn push_headers(&self, headers: Vec<HeaderWrapper>);

    /// Called with each run of blocks newly contiguous with the last
    /// emitted block, in strictly ascending height order, without gaps or
    /// duplicates.
    fn push_blocks(&self, blocks: Vec<BlockWrapper>);

    /// How many more blocks the importer is willing to admit right now.
    ///
    /// The body worker skips dispatching entirely while this is at most
    /// [`MAX_IN_REQUEST`].
    fn block_queue_free_size(&self) -> usize;

    /// Terminal hook, called exactly once when the download completes.
    fn finish_download(&self) {}

    /// Whether the node is likely caught up with the network tip.
    ///
    /// Switches the header worker to its slow steady-state poll.
    fn is_close_to_tip(&self) -> bool {
        false
    }
}

/// Downloads the header chain and block bodies from a pool of peers and
/// feeds them, in order, to the embedding application.
///
/// Generic over its four seams: the reassembly queue, the peer pool, the
/// header validator, and the downstream sink.
pub struct BlockDownloader<Q, P, V, D>
where
    Q: SyncQueue,
    P: PeerPool,
    V: HeaderValidator,
    D: DownloadSink,
{
    config: Config,
    validator: Arc<V>,
    sink: Arc<D>,
    stop_sender: watch::Sender<bool>,
    shared: Option<Arc<Shared<Q, P, V, D>>>,
    header_worker: Option<JoinHandle<()>>,
    body_worker: Option<JoinHandle<()>>,
}

impl<Q, P, V, D> BlockDownloader<Q, P, V, D>
where
    Q: SyncQueue,
    P: PeerPool,
    V: HeaderValidator,
    D: DownloadSink,
{
    /// Returns a new downloader, not yet started.
    ///
    /// Limits below the per-request maximum would deadlock the workers, so
    /// they are raised to it.
    pub fn new(mut config: Config, validator: Arc<V>, sink: Arc<D>) -> Self {
        if config.header_queue_limit < MAX_IN_REQUEST {
            warn!(
                "configured header queue limit {} too low, increasing to {}",
                config.header_queue_limit, MAX_IN_REQUEST,
            );
            config.header_queue_limit = MAX_IN_REQUEST;
        }

        let (stop_sender, _) = watch::channel(false);

        Self {
            config,
            validator,
            sink,
            stop_sender,
            shared: None,
            header_worker: None,
            body_worker: None,
        }
    }

    /// Start the enabled workers against `queue` and `pool`.
    pub fn init(&mut self, queue: Arc<Mutex<Q>>, pool: Arc<P>) {
        assert!(
            self.shared.is_none(),
            "a block downloader is only initialized once"
        );

        info!(
            headers = self.config.headers_download,
            bodies = self.config.block_bodies_download,
            "initializing block downloader"
        );

        let shared = Arc::new(Shared {
            queue,
            pool,
            validator: Arc::clone(&self.validator),
            sink: Arc::clone(&self.sink),
            header_queue_limit: self.config.header_queue_limit,
            block_bodies_download: self.config.block_bodies_download,
            headers_latch: Mutex::new(Arc::new(Latch::new(0))),
            blocks_latch: Mutex::new(Arc::new(Latch::new(0))),
            headers_download_complete: AtomicBool::new(false),
            download_complete: AtomicBool::new(false),
            finish_called: AtomicBool::new(false),
        });
        self.shared = Some(Arc::clone(&shared));

        if self.config.headers_download {
            let worker = Arc::clone(&shared).header_retrieve_loop(self.stop_sender.subscribe());
            self.header_worker = Some(tokio::spawn(worker.in_current_span()));
        }

        if self.config.block_bodies_download {
            let worker = Arc::clone(&shared).block_retrieve_loop(self.stop_sender.subscribe());
            self.body_worker = Some(tokio::spawn(worker.in_current_span()));
        }
    }

    /// Signal both workers to exit.
    ///
    /// Idempotent. Pending completion callbacks observe the signal and
    /// discard their results instead of touching the queue.
    pub fn stop(&self) {
        let _ = self.stop_sender.send(true);
    }

    /// Wait until every started worker has exited, after [`stop`](Self::stop)
    /// or after the download finished on its own.
    pub async fn wait_for_stop(&mut self) {
        if let Some(worker) = self.header_worker.take() {
            let _ = worker.await;
        }
        if let Some(worker) = self.body_worker.take() {
            let _ = worker.await;
        }
    }

    /// Stop the workers and close the underlying peer pool.
    ///
    /// A pool that fails to close cleanly is logged and otherwise
    /// ignored; the workers are stopped regardless.
    pub fn close(&self) {
        if let Some(shared) = &self.shared {
            if let Err(error) = shared.pool.close() {
                warn!(%error, "problems closing the peer pool");
            }
        }
        self.stop();
    }

    /// Whether the whole download has completed.
    pub fn is_download_complete(&self) -> bool {
        self.shared
            .as_ref()
            .map(|shared| shared.download_complete.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Whether the header chain has been fully downloaded.
    pub fn is_headers_download_complete(&self) -> bool {
        self.shared
            .as_ref()
            .map(|shared| shared.headers_download_complete.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// The configured importer queue size.
    pub fn block_queue_limit(&self) -> usize {
        self.config.block_queue_limit
    }
}

/// The state shared between the workers and their completion tasks.
struct Shared<Q, P, V, D>
where
    Q: SyncQueue,
    P: PeerPool,
    V: HeaderValidator,
    D: DownloadSink,
{
    queue: Arc<Mutex<Q>>,
    pool: Arc<P>,
    validator: Arc<V>,
    sink: Arc<D>,

    header_queue_limit: usize,
    block_bodies_download: bool,

    /// The latch armed by the current header round. Completion tasks count
    /// down whichever latch is current when they finish.
    headers_latch: Mutex<Arc<Latch>>,
    blocks_latch: Mutex<Arc<Latch>>,

    headers_download_complete: AtomicBool,
    download_complete: AtomicBool,
    finish_called: AtomicBool,
}

impl<Q, P, V, D> Shared<Q, P, V, D>
where
    Q: SyncQueue,
    P: PeerPool,
    V: HeaderValidator,
    D: DownloadSink,
{
    fn lock_queue(&self) -> MutexGuard<'_, Q> {
        self.queue
            .lock()
            .expect("thread panicked while holding the sync queue lock")
    }

    fn arm_headers_latch(&self, count: usize) -> Arc<Latch> {
        let latch = Arc::new(Latch::new(count));
        *self
            .headers_latch
            .lock()
            .expect("thread panicked while holding the header latch slot") = Arc::clone(&latch);
        latch
    }

    fn arm_blocks_latch(&self, count: usize) -> Arc<Latch> {
        let latch = Arc::new(Latch::new(count));
        *self
            .blocks_latch
            .lock()
            .expect("thread panicked while holding the block latch slot") = Arc::clone(&latch);
        latch
    }

    fn count_down_headers(&self) {
        self.headers_latch
            .lock()
            .expect("thread panicked while holding the header latch slot")
            .count_down();
    }

    fn count_down_blocks(&self) {
        self.blocks_latch
            .lock()
            .expect("thread panicked while holding the block latch slot")
            .count_down();
    }

    /// Sever a peer, re-resolving its identity through the pool: the
    /// handle the request was dispatched on may already be gone.
    fn drop_peer(&self, id: PeerId) {
        if let Some(peer) = self.pool.by_node_id(&id) {
            peer.drop_connection();
        }
    }

    fn finish(&self) {
        if !self.finish_called.swap(true, Ordering::SeqCst) {
            self.sink.finish_download();
        }
        self.download_complete.store(true, Ordering::SeqCst);
    }

    /// The header worker: pull requests from the queue, spread them across
    /// idle peers, wait for roughly half of them to complete, repeat.
    #[instrument(skip_all, name = "header_retrieve_loop")]
    async fn header_retrieve_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut pending: Vec<HeadersRequest> = Vec::new();

        while !*stop.borrow() {
            if pending.is_empty() {
                let requests = self.lock_queue().request_headers(
                    MAX_IN_REQUEST,
                    MAX_HEADER_REQUESTS_PER_ROUND,
                    self.header_queue_limit,
                );
                match requests {
                    None => {
                        info!("headers download complete");
                        self.headers_download_complete.store(true, Ordering::SeqCst);
                        if !self.block_bodies_download {
                            self.finish();
                        }
                        return;
                    }
                    Some(requests) => {
                        if !requests.is_empty() {
                            debug!(count = requests.len(), first = %requests[0], "new header requests");
                        }
                        pending = requests;
                    }
                }
            }

            let mut dispatched = 0;
            let mut index = 0;
            while index < pending.len() {
                let Some(peer) = self.pool.any_idle() else {
                    debug!("no idle peers found");
                    break;
                };

                let future = match &pending[index] {
                    HeadersRequest::ByNumber {
                        start,
                        count,
                        reverse,
                    } => peer.send_get_block_headers(*start, *count, *reverse),
                    HeadersRequest::ByHash {
                        anchor,
                        count,
                        step,
                        reverse,
                    } => peer.send_get_block_headers_by_hash(*anchor, *count, *step, *reverse),
                };

                match future {
                    // The peer went away between `any_idle` and the send;
                    // keep the request for another peer.
                    None => index += 1,
                    Some(future) => {
                        let request = pending.remove(index);
                        trace!(%request, peer = %peer.node_id(), "dispatched header request");
                        metrics::counter!("sync.dispatched.header.request.count").increment(1);
                        dispatched += 1;

                        Arc::clone(&self).spawn_headers_completion(
                            peer.node_id(),
                            future,
                            stop.clone(),
                        );
                    }
                }
            }

            // Re-enter dispatch once about half the round has returned,
            // instead of pacing the loop by its slowest peer.
            let latch = self.arm_headers_latch(max(dispatched / 2, 1));
            let wait = if self.sink.is_close_to_tip() {
                STEADY_STATE_HEADERS_LATCH_TIMEOUT
            } else {
                HEADERS_LATCH_TIMEOUT
            };
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = latch.wait(wait) => {}
            }
        }
    }

    fn spawn_headers_completion(
        self: Arc<Self>,
        peer_id: PeerId,
        future: HeadersResponseFuture,
        stop: watch::Receiver<bool>,
    ) {
        tokio::spawn(
            async move {
                let result = future.await;

                if *stop.borrow() {
                    trace!(peer = %peer_id, "discarding headers received after stop");
                    return;
                }

                match result {
                    Ok(headers) => self.handle_headers_response(peer_id, headers),
                    Err(error) => {
                        debug!(%error, peer = %peer_id, "error receiving headers, dropping the peer");
                        self.drop_peer(peer_id);
                        self.count_down_headers();
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn handle_headers_response(&self, peer_id: PeerId, headers: Vec<Header>) {
        if headers.is_empty() {
            trace!(peer = %peer_id, "peer returned no headers");
            return;
        }

        for header in &headers {
            if let Err(error) = self.validator.validate(header) {
                debug!(
                    %error,
                    number = header.number.0,
                    peer = %peer_id,
                    "invalid header, dropping the peer"
                );
                metrics::counter!("sync.rejected.header.batch.count").increment(1);
                self.drop_peer(peer_id);
                self.count_down_headers();
                return;
            }
        }

        let count = headers.len();
        let wrappers = headers
            .into_iter()
            .map(|header| HeaderWrapper::new(Arc::new(header), peer_id))
            .collect();

        {
            let mut queue = self.lock_queue();
            match queue.add_headers(wrappers) {
                Ok(ready) => {
                    if !ready.is_empty() {
                        metrics::counter!("sync.pushed.header.count")
                            .increment(ready.len() as u64);
                        self.sink.push_headers(ready);
                    }
                }
                Err(rejection) => {
                    drop(queue);
                    debug!(%rejection, "rejected header batch, dropping the peer");
                    metrics::counter!("sync.rejected.header.batch.count").increment(1);
                    self.drop_peer(peer_id);
                    self.count_down_headers();
                    return;
                }
            }
        }

        metrics::counter!("sync.downloaded.header.count").increment(count as u64);
        debug!(count, peer = %peer_id, "headers added");
        self.count_down_headers();
    }

    /// The body worker: shard the queue's missing bodies across idle
    /// peers, within the budget the importer's free space allows.
    #[instrument(skip_all, name = "block_retrieve_loop")]
    async fn block_retrieve_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut pending: Vec<BlocksRequest> = Vec::new();

        while !*stop.borrow() {
            if pending.is_empty() {
                pending = self
                    .lock_queue()
                    .request_blocks(BULK_BODY_REQUEST_LIMIT)
                    .split(MAX_IN_REQUEST);
            }

            if pending.is_empty() && self.headers_download_complete.load(Ordering::SeqCst) {
                info!("block download complete");
                self.finish();
                return;
            }

            let free = self.sink.block_queue_free_size();
            let latch = if free > MAX_IN_REQUEST {
                // A single small shard is the fresh tip of the chain: also
                // request those bodies from the peers that sent the
                // headers, which are the most likely to already have them.
                // These dispatches bypass the round budget and leave the
                // shard in place for the normal path.
                if pending.len() == 1 && pending[0].len() <= FRESH_TIP_SHARD_LIMIT {
                    for wrapper in pending[0].headers() {
                        let Some(peer) = self.pool.by_node_id(&wrapper.from()) else {
                            continue;
                        };
                        if let Some(future) = peer.send_get_block_bodies(vec![wrapper.clone()]) {
                            trace!(
                                number = wrapper.number().0,
                                peer = %peer.node_id(),
                                "requesting fresh tip body from its header's sender"
                            );
                            Arc::clone(&self).spawn_blocks_completion(
                                peer.node_id(),
                                future,
                                stop.clone(),
                            );
                        }
                    }
                }

                let max_blocks =
                    MAX_IN_REQUEST * min(free / MAX_IN_REQUEST, BODY_ROUND_REQUEST_MULTIPLIER);
                let mut requested = 0;
                let mut dispatched: usize = 0;
                let mut index = 0;
                while index < pending.len() && requested < max_blocks {
                    let Some(peer) = self.pool.any_idle() else {
                        debug!("no idle peers found");
                        break;
                    };

                    requested += pending[index].len();
                    match peer.send_get_block_bodies(pending[index].headers().to_vec()) {
                        None => index += 1,
                        Some(future) => {
                            let shard = pending.remove(index);
                            debug!(
                                bodies = shard.len(),
                                peer = %peer.node_id(),
                                "requesting block bodies"
                            );
                            metrics::counter!("sync.dispatched.block.request.count").increment(1);
                            dispatched += 1;

                            Arc::clone(&self).spawn_blocks_completion(
                                peer.node_id(),
                                future,
                                stop.clone(),
                            );
                        }
                    }
                }

                // The -2 lets the round re-enter dispatch after most, but
                // not all, of its callbacks have landed.
                self.arm_blocks_latch(max(dispatched.saturating_sub(2), 1))
            } else {
                debug!(free, "import queue is full");
                metrics::counter!("sync.block.queue.full.count").increment(1);
                self.arm_blocks_latch(1)
            };

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = latch.wait(BODIES_LATCH_TIMEOUT) => {}
            }
        }
    }

    fn spawn_blocks_completion(
        self: Arc<Self>,
        peer_id: PeerId,
        future: BodiesResponseFuture,
        stop: watch::Receiver<bool>,
    ) {
        tokio::spawn(
            async move {
                let result = future.await;

                if *stop.borrow() {
                    trace!(peer = %peer_id, "discarding blocks received after stop");
                    return;
                }

                match result {
                    Ok(blocks) => self.handle_blocks_response(peer_id, blocks),
                    Err(error) => {
                        debug!(%error, peer = %peer_id, "error receiving blocks, dropping the peer");
                        self.drop_peer(peer_id);
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn handle_blocks_response(&self, peer_id: PeerId, blocks: Vec<Block>) {
        if blocks.is_empty() {
            return;
        }

        let count = blocks.len();
        debug!(
            count,
            first = %blocks[0],
            last = %blocks[count - 1],
            peer = %peer_id,
            "adding blocks to the sync queue"
        );

        {
            let mut queue = self.lock_queue();
            let ready = queue.add_blocks(blocks);
            if !ready.is_empty() {
                debug!(count = ready.len(), "pushing blocks to the import queue");
                metrics::counter!("sync.pushed.block.count").increment(ready.len() as u64);

                let wrappers = ready
                    .into_iter()
                    .map(|block| BlockWrapper::new(block, peer_id))
                    .collect();
                self.sink.push_blocks(wrappers);
            }
        }

        metrics::counter!("sync.downloaded.block.count").increment(count as u64);
        self.count_down_blocks();
    }
}
