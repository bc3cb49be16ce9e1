//! Property tests for fragmentation and reassembly.
//!
//! Fragments produced by the sender must reassemble into the original
//! payload regardless of arrival order, duplication, or packet size.

use std::time::Duration;

use proptest::prelude::*;

use dcnet::runtime::driver::pool::FragmentRingPool;
use dcnet::runtime::driver::protocol::{HEADER_SIZE, MessageType, parse_datagram};
use dcnet::runtime::driver::reassembly::{
    Completion, MessageReassembler, RejectReason, UpdateResult,
};
use dcnet::runtime::driver::tx_thread::fragment_message;

/// Feeds datagrams in the given order and returns the finished message.
fn reassemble_in_order(fragments: &[Vec<u8>], order: &[usize]) -> Completion {
    let mut reassembler = MessageReassembler::new(8, Duration::from_secs(1));
    let mut now = 1_000;
    for &i in order {
        let (header, body) = parse_datagram(&fragments[i], true).expect("valid fragment");
        now += 10;
        if reassembler.update(&header, body, now) == UpdateResult::Complete {
            return reassembler.finish(header.message_id);
        }
    }
    Completion::NotReady
}

/// A permutation of `0..n`.
fn permutation(n: usize) -> impl Strategy<Value = Vec<usize>> {
    Just((0..n).collect::<Vec<_>>()).prop_shuffle()
}

fn payload_and_order() -> impl Strategy<Value = (Vec<u8>, usize, Vec<usize>)> {
    (
        prop::collection::vec(any::<u8>(), 0..20_000),
        (HEADER_SIZE + 1)..2_000usize,
    )
        .prop_flat_map(|(payload, packet_size)| {
            let chunk = packet_size - HEADER_SIZE;
            let count = payload.len().div_ceil(chunk).max(1);
            (Just(payload), Just(packet_size), permutation(count))
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_arrival_order_reassembles((payload, packet_size, order) in payload_and_order()) {
        let fragments = fragment_message(0x0102_0304, MessageType::DataFrame, 5, &payload, packet_size, true)
            .expect("fragment");
        prop_assert_eq!(fragments.len(), order.len());
        for fragment in &fragments {
            prop_assert!(fragment.len() <= packet_size);
        }

        match reassemble_in_order(&fragments, &order) {
            Completion::Accepted(message) => {
                prop_assert_eq!(message.message_id, 5);
                prop_assert_eq!(message.sender_id, 0x0102_0304);
                prop_assert_eq!(message.data, payload);
            }
            other => prop_assert!(false, "expected a message, got {:?}", other),
        }
    }

    #[test]
    fn duplicates_do_not_change_the_result(
        (payload, packet_size, order) in payload_and_order(),
        repeat in any::<prop::sample::Index>(),
    ) {
        let fragments = fragment_message(9, MessageType::DataFrame, 1, &payload, packet_size, false)
            .expect("fragment");
        // Send one fragment twice before the rest.
        let mut with_dup = vec![order[repeat.index(order.len())]];
        with_dup.extend(&order);

        match reassemble_in_order(&fragments, &with_dup) {
            Completion::Accepted(message) => prop_assert_eq!(message.data, payload),
            other => prop_assert!(false, "expected a message, got {:?}", other),
        }
    }

    #[test]
    fn pool_slots_cover_requested_size(
        depth in 1..16usize,
        sizes in prop::collection::vec(0..4_096usize, 1..64),
    ) {
        let mut pool = FragmentRingPool::new(depth, 64);
        let mut handles = Vec::new();
        for &size in &sizes {
            let handle = pool.acquire(size);
            prop_assert_eq!(pool.get_mut(handle).map(|s| s.len()), Some(size));
            handles.push(handle);
        }
        // Only the last `depth` acquisitions survive rotation.
        let live = handles.iter().filter(|h| pool.is_live(**h)).count();
        prop_assert_eq!(live, sizes.len().min(depth));
    }

    #[test]
    fn overruns_only_above_pool_depth(depth in 1..12usize, in_flight in 1..24usize) {
        let mut reassembler = MessageReassembler::new(depth, Duration::from_secs(1));
        let messages: Vec<(Vec<u8>, Vec<Vec<u8>>)> = (0..in_flight)
            .map(|i| {
                let payload = vec![i as u8; 200];
                let fragments = fragment_message(1, MessageType::DataFrame, i as i32, &payload, 135, false)
                    .expect("fragment");
                (payload, fragments)
            })
            .collect();

        // Open every message, then finish them oldest first.
        for (i, (_, fragments)) in messages.iter().enumerate() {
            let (mut header, body) = parse_datagram(&fragments[0], false).expect("valid");
            header.creation_timestamp_ns = (i as i64 + 1) * 1_000;
            prop_assert_eq!(reassembler.update(&header, body, 0), UpdateResult::Pending);
        }
        let mut delivered = 0;
        for (i, (payload, fragments)) in messages.iter().enumerate() {
            let (mut header, body) = parse_datagram(&fragments[1], false).expect("valid");
            header.creation_timestamp_ns = (i as i64 + 1) * 1_000;
            match reassembler.update(&header, body, 0) {
                UpdateResult::Complete => match reassembler.finish(header.message_id) {
                    Completion::Accepted(message) => {
                        prop_assert_eq!(&message.data, payload);
                        delivered += 1;
                    }
                    other => prop_assert!(false, "expected a message, got {:?}", other),
                },
                UpdateResult::Rejected(RejectReason::Overrun) => {
                    prop_assert!(in_flight > depth, "overrun with {} of {} slots", in_flight, depth);
                }
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
        prop_assert_eq!(delivered, in_flight.min(depth));
        prop_assert_eq!(reassembler.stats().overruns as usize, in_flight.saturating_sub(depth));
    }
}

#[test]
fn six_fragments_in_scrambled_order() {
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
    let fragments =
        fragment_message(1, MessageType::DataFrame, 42, &payload, 9000, true).expect("fragment");
    assert_eq!(fragments.len(), 6);

    match reassemble_in_order(&fragments, &[2, 0, 4, 1, 5, 3]) {
        Completion::Accepted(message) => {
            assert_eq!(message.message_id, 42);
            assert_eq!(message.data, payload);
        }
        other => panic!("expected a message, got {other:?}"),
    }
}

#[test]
fn missing_fragment_never_completes() {
    let payload = vec![7u8; 30_000];
    let fragments =
        fragment_message(1, MessageType::DataFrame, 3, &payload, 9000, true).expect("fragment");
    assert_eq!(fragments.len(), 4);
    assert_eq!(reassemble_in_order(&fragments, &[0, 1, 3]), Completion::NotReady);
}
