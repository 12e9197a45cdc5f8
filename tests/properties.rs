//! Property Tests - allocator and simulator invariants over generated inputs.

use flash_arena::{Arena, ArenaConfig, ArenaPtr, CacheGeometry, CacheSimulator, ErrorKind, HeapProvider};
use proptest::prelude::*;

fn arena() -> Arena {
    Arena::with_provider(ArenaConfig::default(), Box::new(HeapProvider)).unwrap()
}

fn block_size(size: usize) -> u32 {
    ((size + 16 + 63) & !63) as u32
}

#[derive(Clone, Debug)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..=1024).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn allocations_honour_alignment(size in 1usize..=2048, shift in 0u32..=12) {
        let alignment = 1usize << shift;
        let mut arena = arena();
        let ptr = arena.allocate(size, alignment).unwrap();
        prop_assert_eq!(arena.address_of(ptr) % alignment.max(64), 0);
        prop_assert!(arena.usable_size(ptr).unwrap() >= size);
    }

    #[test]
    fn live_blocks_never_overlap(ops in prop::collection::vec(op(), 1..300)) {
        let mut arena = arena();
        let mut live: Vec<(ArenaPtr, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Ok(ptr) = arena.allocate(size, 0) {
                        let start = ptr.offset() as usize;
                        for &(other, other_size) in &live {
                            let other_start = other.offset() as usize;
                            prop_assert!(
                                start + size <= other_start || other_start + other_size <= start,
                                "{:?}+{} overlaps {:?}+{}", ptr, size, other, other_size
                            );
                        }
                        live.push((ptr, size));
                    }
                }
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let (ptr, _) = live.swap_remove(pick % live.len());
                        arena.free(ptr).unwrap();
                    }
                }
            }
        }
        arena.validate().unwrap();
    }

    #[test]
    fn second_free_is_corruption(size in 1usize..=4000) {
        let mut arena = arena();
        let ptr = arena.allocate(size, 0).unwrap();
        arena.free(ptr).unwrap();
        prop_assert_eq!(arena.free(ptr).unwrap_err().kind(), ErrorKind::Corruption);
    }

    #[test]
    fn reset_replays_identically(sizes in prop::collection::vec(1usize..=1024, 1..100)) {
        let mut arena = arena();
        let before: Vec<ArenaPtr> = sizes.iter().filter_map(|&s| arena.allocate(s, 0).ok()).collect();

        arena.reset();
        prop_assert!(arena.sub_arenas().iter().all(|sa| sa.used_size == 0));

        let after: Vec<ArenaPtr> = sizes.iter().filter_map(|&s| arena.allocate(s, 0).ok()).collect();
        prop_assert_eq!(before, after);
    }

    #[test]
    fn batch_is_contiguous_or_absent(sizes in prop::collection::vec(1usize..=2048, 1..16)) {
        let mut arena = arena();
        let hash = arena.state_hash();
        let allocations = arena.get_stats().counters.allocations;

        match arena.allocate_batch(&sizes) {
            Ok(ptrs) => {
                prop_assert_eq!(ptrs.len(), sizes.len());
                for (pair, &size) in ptrs.windows(2).zip(&sizes) {
                    prop_assert_eq!(pair[1].offset() - pair[0].offset(), block_size(size));
                }
            }
            Err(err) => {
                prop_assert_eq!(err.kind(), ErrorKind::OutOfMemory);
                prop_assert_eq!(arena.state_hash(), hash);
                prop_assert_eq!(arena.get_stats().counters.allocations, allocations);
            }
        }
    }

    #[test]
    fn realloc_keeps_or_copies(old_size in 1usize..=1024, new_size in 1usize..=2048, fill in any::<u8>()) {
        let mut arena = arena();
        let ptr = arena.allocate(old_size, 0).unwrap();
        arena.bytes_mut(ptr, old_size).unwrap().fill(fill);

        let moved = arena.realloc(ptr, new_size).unwrap();
        if new_size <= old_size {
            prop_assert_eq!(moved, ptr);
        }
        let kept = old_size.min(new_size);
        prop_assert!(arena.bytes(moved, kept).unwrap().iter().all(|&b| b == fill));
    }

    #[test]
    fn simulator_replay_is_deterministic(addresses in prop::collection::vec(0u64..1 << 20, 1..2000)) {
        let geometry = CacheGeometry::new(4096, 64, 4);
        let mut first = CacheSimulator::new(geometry).unwrap();
        let mut second = CacheSimulator::new(geometry).unwrap();

        for &address in &addresses {
            prop_assert_eq!(first.access(address, 8, false), second.access(address, 8, false));
        }
        prop_assert_eq!(first.stats(), second.stats());
    }
}
