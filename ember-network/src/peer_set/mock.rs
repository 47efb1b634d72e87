//! Scriptable in-memory peers for pipeline tests.
//!
//! A [`MockChain`] is a deterministic canonical chain, and a [`MockPeer`]
//! serves (or mis-serves) it according to its [`PeerBehavior`]. The mocks
//! track idleness the way a real transport would: a peer is busy from the
//! moment a request is dispatched until its response future completes or
//! is dropped.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{future, FutureExt};
use tracing::debug;

use ember_chain::block::{body_for, header_chain, Block, Hash, Header, Height};

use crate::{
    BodiesResponseFuture, HeaderWrapper, HeadersResponseFuture, PeerError, PeerHandle, PeerId,
    PeerPool,
};

#[cfg(test)]
mod tests;

/// A deterministic canonical chain served by mock peers.
pub struct MockChain {
    headers: Vec<Arc<Header>>,
    by_hash: HashMap<Hash, usize>,
}

impl MockChain {
    /// Build a linear chain with heights `0..=len`: a genesis block plus
    /// `len` descendants.
    pub fn linear(len: u64) -> Arc<Self> {
        let headers = header_chain(Hash([0; 32]), Height(0), len as usize + 1);
        let by_hash = headers
            .iter()
            .enumerate()
            .map(|(index, header)| (header.hash(), index))
            .collect();

        Arc::new(Self { headers, by_hash })
    }

    /// The genesis header, at height 0.
    pub fn genesis(&self) -> &Arc<Header> {
        &self.headers[0]
    }

    /// The height of the last header in the chain.
    pub fn tip_height(&self) -> Height {
        self.headers
            .last()
            .expect("a mock chain is never empty")
            .number
    }

    /// The header at `number`, if the chain is that long.
    pub fn header_at(&self, number: Height) -> Option<&Arc<Header>> {
        self.headers.get(number.0 as usize)
    }

    /// The full block committed to by the header with hash `hash`.
    pub fn block_for(&self, hash: &Hash) -> Option<Block> {
        let header = self.headers[*self.by_hash.get(hash)?].clone();
        let body = body_for(&header);

        Some(Block { header, body })
    }

    /// An honest response to a number-based header request.
    pub fn headers_from(&self, start: Height, count: u32, reverse: bool) -> Vec<Header> {
        let mut response = Vec::new();
        let mut number = start.0 as i128;

        for _ in 0..count {
            if number < 0 {
                break;
            }
            match self.header_at(Height(number as u64)) {
                Some(header) => response.push(Header::clone(header)),
                None => break,
            }
            number += if reverse { -1 } else { 1 };
        }

        response
    }

    /// An honest response to a hash-anchored skip-list header request.
    pub fn headers_anchored(
        &self,
        anchor: &Hash,
        count: u32,
        step: u32,
        reverse: bool,
    ) -> Vec<Header> {
        let Some(&index) = self.by_hash.get(anchor) else {
            return Vec::new();
        };
        let start = self.headers[index].number;
        let stride = step.max(1) as i128;

        let mut response = Vec::new();
        let mut number = start.0 as i128;
        for _ in 0..count {
            if number < 0 {
                break;
            }
            match self.header_at(Height(number as u64)) {
                Some(header) => response.push(Header::clone(header)),
                None => break,
            }
            number += if reverse { -stride } else { stride };
        }

        response
    }
}

/// How a [`MockPeer`] answers requests.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PeerBehavior {
    /// Serve the canonical chain correctly.
    #[default]
    Honest,

    /// Serve the canonical chain, but break the parent link of the header
    /// at this height.
    CorruptParentAt(Height),

    /// Serve the canonical chain correctly, after this delay.
    Delayed(Duration),

    /// Accept requests whose response futures never resolve.
    Silent,

    /// Fail every request with a transport error.
    Erroring,

    /// Refuse to carry requests: sends return `None`.
    Gone,
}

/// A scriptable peer serving a [`MockChain`].
pub struct MockPeer {
    id: PeerId,
    chain: Arc<MockChain>,
    headers_behavior: PeerBehavior,
    bodies_behavior: PeerBehavior,
    in_flight: Arc<AtomicUsize>,
    dropped: AtomicBool,
    header_requests: AtomicUsize,
    body_requests: AtomicUsize,
}

impl MockPeer {
    /// A new honest peer with an identity derived from `seed`.
    pub fn new(seed: u8, chain: Arc<MockChain>) -> Self {
        Self {
            id: PeerId([seed; 32]),
            chain,
            headers_behavior: PeerBehavior::Honest,
            bodies_behavior: PeerBehavior::Honest,
            in_flight: Arc::new(AtomicUsize::new(0)),
            dropped: AtomicBool::new(false),
            header_requests: AtomicUsize::new(0),
            body_requests: AtomicUsize::new(0),
        }
    }

    /// Override how this peer answers header requests.
    pub fn with_headers_behavior(mut self, behavior: PeerBehavior) -> Self {
        self.headers_behavior = behavior;
        self
    }

    /// Override how this peer answers body requests.
    pub fn with_bodies_behavior(mut self, behavior: PeerBehavior) -> Self {
        self.bodies_behavior = behavior;
        self
    }

    /// Whether [`PeerHandle::drop_connection`] has been called.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// How many header requests this peer accepted.
    pub fn header_requests(&self) -> usize {
        self.header_requests.load(Ordering::SeqCst)
    }

    /// How many body requests this peer accepted.
    pub fn body_requests(&self) -> usize {
        self.body_requests.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        !self.is_dropped() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Wraps a response so the peer stays busy until the caller consumes
    /// (or drops) it.
    fn track<T: Send + 'static>(
        &self,
        response: future::BoxFuture<'static, T>,
    ) -> future::BoxFuture<'static, T> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        async move {
            let _guard = guard;
            response.await
        }
        .boxed()
    }

    fn respond_headers(&self, honest: Vec<Header>) -> Option<HeadersResponseFuture> {
        let response = match self.headers_behavior {
            PeerBehavior::Honest => Ok(honest),
            PeerBehavior::CorruptParentAt(at) => Ok(corrupt_parent_link(honest, at)),
            PeerBehavior::Delayed(delay) => {
                return Some(self.track(
                    async move {
                        tokio::time::sleep(delay).await;
                        Ok(honest)
                    }
                    .boxed(),
                ))
            }
            PeerBehavior::Silent => return Some(self.track(future::pending().boxed())),
            PeerBehavior::Erroring => Err(PeerError::ConnectionClosed),
            PeerBehavior::Gone => unreachable!("gone peers never accept requests"),
        };

        Some(self.track(future::ready(response).boxed()))
    }
}

impl PeerHandle for MockPeer {
    fn node_id(&self) -> PeerId {
        self.id
    }

    fn send_get_block_headers(
        &self,
        start: Height,
        count: u32,
        reverse: bool,
    ) -> Option<HeadersResponseFuture> {
        if self.is_dropped() || self.headers_behavior == PeerBehavior::Gone {
            return None;
        }
        self.header_requests.fetch_add(1, Ordering::SeqCst);

        let honest = self.chain.headers_from(start, count, reverse);
        self.respond_headers(honest)
    }

    fn send_get_block_headers_by_hash(
        &self,
        anchor: Hash,
        count: u32,
        step: u32,
        reverse: bool,
    ) -> Option<HeadersResponseFuture> {
        if self.is_dropped() || self.headers_behavior == PeerBehavior::Gone {
            return None;
        }
        self.header_requests.fetch_add(1, Ordering::SeqCst);

        let honest = self.chain.headers_anchored(&anchor, count, step, reverse);
        self.respond_headers(honest)
    }

    fn send_get_block_bodies(&self, headers: Vec<HeaderWrapper>) -> Option<BodiesResponseFuture> {
        if self.is_dropped() || self.bodies_behavior == PeerBehavior::Gone {
            return None;
        }
        self.body_requests.fetch_add(1, Ordering::SeqCst);

        let honest: Vec<Block> = headers
            .iter()
            .filter_map(|wrapper| self.chain.block_for(&wrapper.hash()))
            .collect();

        let response = match self.bodies_behavior {
            PeerBehavior::Honest | PeerBehavior::CorruptParentAt(_) => Ok(honest),
            PeerBehavior::Delayed(delay) => {
                return Some(self.track(
                    async move {
                        tokio::time::sleep(delay).await;
                        Ok(honest)
                    }
                    .boxed(),
                ))
            }
            PeerBehavior::Silent => return Some(self.track(future::pending().boxed())),
            PeerBehavior::Erroring => Err(PeerError::ConnectionClosed),
            PeerBehavior::Gone => unreachable!("gone peers never accept requests"),
        };

        Some(self.track(future::ready(response).boxed()))
    }

    fn drop_connection(&self) {
        debug!(peer = %self.id, "dropping mock peer connection");
        self.dropped.store(true, Ordering::SeqCst);
    }
}

fn corrupt_parent_link(mut headers: Vec<Header>, at: Height) -> Vec<Header> {
    for header in &mut headers {
        if header.number == at {
            header.parent_hash = Hash([0xaa; 32]);
        }
    }
    headers
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A concurrently-usable pool of [`MockPeer`]s.
#[derive(Default)]
pub struct MockPeerPool {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    next: AtomicUsize,
    closed: AtomicBool,
}

impl MockPeerPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// A pool of `count` honest peers serving `chain`.
    pub fn honest(count: u8, chain: &Arc<MockChain>) -> Arc<Self> {
        let pool = Self::new();
        for seed in 1..=count {
            pool.add(Arc::new(MockPeer::new(seed, Arc::clone(chain))));
        }

        Arc::new(pool)
    }

    /// Add a peer to the pool.
    pub fn add(&self, peer: Arc<MockPeer>) {
        self.peers
            .lock()
            .expect("thread panicked while holding the mock pool lock")
            .push(peer);
    }

    /// A snapshot of every peer ever added, dropped peers included.
    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers
            .lock()
            .expect("thread panicked while holding the mock pool lock")
            .clone()
    }

    /// Whether [`PeerPool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PeerPool for MockPeerPool {
    type Handle = MockPeer;

    fn any_idle(&self) -> Option<Arc<MockPeer>> {
        let peers = self
            .peers
            .lock()
            .expect("thread panicked while holding the mock pool lock");
        if peers.is_empty() {
            return None;
        }

        // Round-robin, so tests spread work across peers deterministically.
        let start = self.next.fetch_add(1, Ordering::SeqCst);
        (0..peers.len())
            .map(|offset| &peers[(start + offset) % peers.len()])
            .find(|peer| peer.is_idle())
            .cloned()
    }

    fn by_node_id(&self, id: &PeerId) -> Option<Arc<MockPeer>> {
        self.peers
            .lock()
            .expect("thread panicked while holding the mock pool lock")
            .iter()
            .find(|peer| peer.node_id() == *id && !peer.is_dropped())
            .cloned()
    }

    fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        for peer in self.peers().iter() {
            peer.drop_connection();
        }

        Ok(())
    }
}
