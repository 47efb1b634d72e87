//! Randomised property tests for the reassembly queue.

use proptest::prelude::*;

use super::*;
use crate::MAX_IN_REQUEST;

/// Serve every outstanding request honestly, delivering the response
/// batches in `order`, and return everything the queue emitted.
fn serve_header_round(
    queue: &mut ReassemblyQueue,
    chain: &[std::sync::Arc<Header>],
    requests: Vec<HeadersRequest>,
    order: &[usize],
    duplicate: bool,
) -> Vec<HeaderWrapper> {
    let mut emitted = Vec::new();

    let batches: Vec<_> = requests
        .iter()
        .map(|request| match request {
            HeadersRequest::ByNumber { start, count, .. } => {
                let end = (start.0 + *count as u64 - 1).min(chain.len() as u64 - 1);
                wrap(chain, start.0..=end, PEER_A)
            }
            HeadersRequest::ByHash { .. } => {
                unreachable!("the scheduler only issues number-based requests")
            }
        })
        .collect();

    for &index in order {
        let batch = batches[index % batches.len()].clone();
        emitted.extend(
            queue
                .add_headers(batch.clone())
                .expect("honest batches are absorbed"),
        );
        if duplicate {
            emitted.extend(
                queue
                    .add_headers(batch)
                    .expect("duplicate honest batches are absorbed"),
            );
        }
    }

    emitted
}

proptest! {
    /// However responses are reordered and duplicated, every height is
    /// emitted exactly once, in strictly ascending order, and the parent
    /// links of the emitted sequence hold.
    #[test]
    fn headers_emit_every_height_exactly_once(
        len in 1u64..400,
        seed_order in proptest::collection::vec(0usize..8, 1..8),
        duplicate in any::<bool>(),
    ) {
        let chain = test_chain(len as usize);
        let mut queue = queue_for(&chain, Some(len), false);
        let mut emitted = Vec::new();

        // Reservations never expire within a test case, so drive rounds
        // until the queue reports completion: each round serves whatever
        // is outstanding, in an arbitrary order.
        loop {
            let Some(requests) = queue.request_headers(MAX_IN_REQUEST, 128, 10_000) else {
                break;
            };
            if requests.is_empty() {
                // Everything is in flight; this only happens if a served
                // round failed to complete the chain, which the loop
                // below would have caught.
                prop_assert!(false, "the queue stalled with work in flight");
            }

            let mut order: Vec<usize> = (0..requests.len()).collect();
            for (position, seed) in seed_order.iter().enumerate() {
                let order_len = order.len();
                if order_len > 1 {
                    let swap_with = (position + seed) % order_len;
                    order.swap(position % order_len, swap_with);
                }
            }

            emitted.extend(serve_header_round(
                &mut queue,
                &chain,
                requests,
                &order,
                duplicate,
            ));
        }

        let heights = header_heights(&emitted);
        prop_assert_eq!(heights, (1..=len).collect::<Vec<_>>());

        for pair in emitted.windows(2) {
            prop_assert_eq!(pair[1].parent_hash(), pair[0].hash());
        }
        prop_assert_eq!(emitted[0].parent_hash(), chain[0].hash());
    }

    /// Blocks arriving in arbitrary chunks and order emit exactly once,
    /// in strictly ascending contiguous order.
    #[test]
    fn blocks_emit_every_height_exactly_once(
        len in 1u64..300,
        chunk in 1usize..50,
        offset in 0usize..50,
        duplicate in any::<bool>(),
    ) {
        let chain = test_chain(len as usize);
        let mut queue = queue_for(&chain, Some(len), true);

        queue
            .request_headers(MAX_IN_REQUEST, 128, 10_000)
            .expect("headers are not complete");
        while queue.tip_height().0 < len {
            let tip = queue.tip_height().0;
            let end = (tip + MAX_IN_REQUEST as u64).min(len);
            queue
                .add_headers(wrap(&chain, tip + 1..=end, PEER_A))
                .expect("honest batches are absorbed");
            if queue.tip_height().0 < len {
                queue
                    .request_headers(MAX_IN_REQUEST, 128, 10_000)
                    .expect("headers are not complete");
            }
        }

        // Deliver bodies in rotated chunks: never in ascending order
        // unless the rotation happens to be zero.
        let mut chunks: Vec<Vec<u64>> = (1..=len)
            .collect::<Vec<_>>()
            .chunks(chunk)
            .map(<[u64]>::to_vec)
            .collect();
        let chunks_len = chunks.len();
        chunks.rotate_left(offset % chunks_len.max(1));

        let mut emitted = Vec::new();
        for numbers in &chunks {
            let blocks: Vec<Block> = numbers.iter().map(|&n| block_at(&chain, n)).collect();
            emitted.extend(queue.add_blocks(blocks.clone()));
            if duplicate {
                emitted.extend(queue.add_blocks(blocks));
            }
        }

        prop_assert_eq!(block_heights(&emitted), (1..=len).collect::<Vec<_>>());
        prop_assert_eq!(queue.pending_header_count(), 0);
        prop_assert!(queue.request_blocks(usize::MAX).is_empty());
    }

    /// A batch with one corrupted parent link anywhere is rejected whole,
    /// and an honest retry still completes the chain: no corrupt header
    /// is ever emitted.
    #[test]
    fn corrupt_batches_never_emit(
        len in 2u64..300,
        corrupt_at in 1u64..300,
    ) {
        let batch_len = len.min(MAX_IN_REQUEST as u64);
        let corrupt_at = (corrupt_at % batch_len).max(1);
        let chain = test_chain(len as usize);
        let mut queue = queue_for(&chain, Some(len), false);

        let requests = queue
            .request_headers(MAX_IN_REQUEST, 128, 10_000)
            .expect("headers are not complete");

        // First response: corrupted at `corrupt_at`.
        let mut batch = wrap(&chain, 1..=batch_len, PEER_B);
        if let Some(slot) = batch.get_mut(corrupt_at as usize - 1) {
            let mut tampered = Header::clone(slot.header());
            tampered.parent_hash = Hash([0xaa; 32]);
            *slot = HeaderWrapper::new(std::sync::Arc::new(tampered), PEER_B);
        }

        let rejection = queue.add_headers(batch);
        prop_assert!(rejection.is_err());
        prop_assert_eq!(queue.tip_height(), Height(0));
        prop_assert_eq!(queue.pending_header_count(), 0);

        // Honest retries complete the chain.
        let mut emitted = Vec::new();
        for request in requests {
            let HeadersRequest::ByNumber { start, count, .. } = request else {
                unreachable!("the scheduler only issues number-based requests");
            };
            let end = (start.0 + count as u64 - 1).min(len);
            emitted.extend(
                queue
                    .add_headers(wrap(&chain, start.0..=end, PEER_A))
                    .expect("honest batches are absorbed"),
            );
        }

        prop_assert_eq!(header_heights(&emitted), (1..=len).collect::<Vec<_>>());
        for wrapper in &emitted {
            prop_assert_eq!(wrapper.header().parent_hash, chain[wrapper.number().0 as usize - 1].hash());
        }
    }
}
