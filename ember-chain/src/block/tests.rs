use std::collections::HashSet;

use proptest::prelude::*;

use super::*;

#[test]
fn header_chain_links() {
    let chain = header_chain(Hash([0; 32]), Height(0), 10);

    for pair in chain.windows(2) {
        assert_eq!(pair[1].parent_hash, pair[0].hash());
        assert_eq!(pair[1].number - pair[0].number, 1);
    }
}

#[test]
fn header_hash_is_stable() {
    let chain = header_chain(Hash([0; 32]), Height(5), 1);
    let header = &chain[0];

    assert_eq!(header.hash(), header.hash());
    assert_eq!(Hash::from(header.as_ref()), header.hash());
}

#[test]
fn body_matches_commitment() {
    for header in header_chain(Hash([0; 32]), Height(0), 20) {
        let body = body_for(&header);
        let block = Block {
            header: header.clone(),
            body,
        };

        assert_eq!(block.hash(), header.hash());
        assert_eq!(block.height(), header.number);
    }
}

#[test]
fn hash_hex_round_trip() {
    let hash = header_chain(Hash([7; 32]), Height(42), 1)[0].hash();
    let hex = hex::encode(hash.0);

    assert_eq!(hex.parse::<Hash>().expect("valid hex"), hash);
    assert!("not hex".parse::<Hash>().is_err());
    assert!("abcd".parse::<Hash>().is_err());
}

proptest! {
    #[test]
    fn distinct_headers_have_distinct_hashes(
        start in 0u64..1_000_000,
        len in 1usize..100,
    ) {
        let chain = header_chain(Hash([0; 32]), Height(start), len);
        let hashes: HashSet<Hash> = chain.iter().map(|h| h.hash()).collect();

        prop_assert_eq!(hashes.len(), chain.len());
    }
}
