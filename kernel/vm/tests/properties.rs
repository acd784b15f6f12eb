//! Property tests for the region table.

use orbis_vm::manager::MapRequest;
use orbis_vm::{
    Backing, CoalescingPolicy, MemoryType, PAGE_SIZE, PhysAddr, Protection, VirtAddr,
    VirtualAddressSpaceManager, VmConfig, VmError,
};
use proptest::prelude::*;

const BASE: u64 = 0x10_0000_0000;
const SLOTS: usize = 32;

fn vm(policy: CoalescingPolicy) -> VirtualAddressSpaceManager {
    let config = VmConfig::default()
        .with_policy(policy)
        .with_direct_memory(0x100_0000)
        .with_flexible_memory(0x100_0000);
    VirtualAddressSpaceManager::new(config).unwrap()
}

fn slot(i: usize) -> VirtAddr {
    VirtAddr::new(BASE + i as u64 * PAGE_SIZE)
}

fn flexible_at(i: usize, pages: usize, prot: Protection) -> MapRequest {
    MapRequest::new(Backing::Flexible, pages as u64 * PAGE_SIZE)
        .fixed(slot(i))
        .prot(prot)
}

fn arb_policy() -> impl Strategy<Value = CoalescingPolicy> {
    prop_oneof![Just(CoalescingPolicy::LEGACY), Just(CoalescingPolicy::CURRENT)]
}

fn arb_prot() -> impl Strategy<Value = Protection> {
    prop_oneof![Just(Protection::READ), Just(Protection::READ_WRITE)]
}

/// Occupancy of each page slot, `None` for a hole.
fn arb_layout() -> impl Strategy<Value = Vec<Option<Protection>>> {
    proptest::collection::vec(proptest::option::of(arb_prot()), SLOTS)
}

fn populate(vm: &VirtualAddressSpaceManager, layout: &[Option<Protection>]) {
    for (i, prot) in layout.iter().enumerate() {
        if let Some(prot) = *prot {
            vm.map(&flexible_at(i, 1, prot)).unwrap();
        }
    }
}

fn flexible_bytes(vm: &VirtualAddressSpaceManager) -> u64 {
    vm.regions()
        .0
        .iter()
        .filter(|r| r.is_flexible())
        .map(|r| r.size())
        .sum()
}

#[derive(Debug, Clone)]
enum Op {
    Map { at: usize, pages: usize, prot: Protection },
    Unmap { at: usize, pages: usize },
    Protect { at: usize, pages: usize, prot: Protection },
    Name { at: usize, pages: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    let span = (0..SLOTS - 4, 1usize..4);
    prop_oneof![
        (span.clone(), arb_prot()).prop_map(|((at, pages), prot)| Op::Map { at, pages, prot }),
        span.clone().prop_map(|(at, pages)| Op::Unmap { at, pages }),
        (span.clone(), arb_prot()).prop_map(|((at, pages), prot)| Op::Protect { at, pages, prot }),
        span.prop_map(|(at, pages)| Op::Name { at, pages }),
    ]
}

/// `(pages, start, len)` with `0 < start` and `start + len < pages`.
fn arb_interior() -> impl Strategy<Value = (usize, usize, usize)> {
    (3usize..16)
        .prop_flat_map(|pages| (Just(pages), 1..pages - 1))
        .prop_flat_map(|(pages, start)| (Just(pages), Just(start), 1..pages - start))
}

proptest! {
    #[test]
    fn map_then_unmap_round_trips(
        policy in arb_policy(),
        mut layout in arb_layout(),
        at in 0..SLOTS - 3,
        pages in 1usize..=3,
        prot in arb_prot(),
    ) {
        layout[at..at + pages].fill(None);
        let vm = vm(policy);
        populate(&vm, &layout);
        let before = vm.regions();
        let used = vm.flexible_used();

        let addr = vm.map(&flexible_at(at, pages, prot)).unwrap();
        prop_assert_eq!(addr, slot(at));
        vm.unmap(addr, pages as u64 * PAGE_SIZE).unwrap();

        prop_assert_eq!(vm.regions(), before);
        prop_assert_eq!(vm.flexible_used(), used);
    }

    #[test]
    fn contiguous_pieces_merge_in_any_order(
        order in Just((0..8u64).collect::<Vec<_>>()).prop_shuffle(),
        direct in any::<bool>(),
    ) {
        let vm = vm(CoalescingPolicy::CURRENT);
        let pool_end = PhysAddr::new(0x100_0000);
        // One single-page extent per piece, handed out at ascending offsets.
        let extents: Vec<PhysAddr> = (0..8)
            .map(|_| {
                vm.allocate_direct(PhysAddr::ZERO, pool_end, PAGE_SIZE, 0, MemoryType::WB_ONION)
                    .unwrap()
            })
            .collect();
        // Scrambled offsets; only virtual contiguity counts.
        let backing_of = |i: u64| extents[((i * 5) % 8) as usize];
        for &i in &order {
            let backing = if direct {
                Backing::Direct { phys: backing_of(i) }
            } else {
                Backing::Flexible
            };
            let req = MapRequest::new(backing, PAGE_SIZE)
                .fixed(VirtAddr::new(BASE + i * PAGE_SIZE));
            vm.map(&req).unwrap();
        }
        let map = vm.regions();
        prop_assert_eq!(map.0.len(), 1);
        prop_assert_eq!(map.0[0].start, VirtAddr::new(BASE));
        prop_assert_eq!(map.0[0].size(), 8 * PAGE_SIZE);
        if direct {
            for i in 0..8 {
                prop_assert_eq!(map.0[0].phys_at(slot(i as usize)), Some(backing_of(i)));
            }
            let mut mapped: Vec<u64> = (0..8).collect();
            for &i in &order {
                vm.release_direct(backing_of(i), PAGE_SIZE, true).unwrap();
                mapped.retain(|&j| j != i);
                prop_assert_eq!(vm.query(slot(i as usize)), Err(VmError::NotFound));
                for &j in &mapped {
                    let info = vm.query(slot(j as usize)).unwrap();
                    prop_assert_eq!(info.phys_at(slot(j as usize)), Some(backing_of(j)));
                }
            }
            prop_assert!(vm.regions().0.is_empty());
        }
    }

    #[test]
    fn direct_map_then_unmap_round_trips(
        mut layout in proptest::collection::vec(proptest::option::of(0..64u64), SLOTS),
        at in 0..SLOTS - 3,
        pages in 1usize..=3,
        page in 0..60u64,
    ) {
        layout[at..at + pages].fill(None);
        let vm = vm(CoalescingPolicy::CURRENT);
        let pool_end = PhysAddr::new(0x100_0000);
        let pool = vm
            .allocate_direct(PhysAddr::ZERO, pool_end, 64 * PAGE_SIZE, 0, MemoryType::WB_ONION)
            .unwrap();
        for (i, page) in layout.iter().enumerate() {
            if let Some(page) = *page {
                let backing = Backing::Direct { phys: pool + page * PAGE_SIZE };
                vm.map(&MapRequest::new(backing, PAGE_SIZE).fixed(slot(i))).unwrap();
            }
        }
        let before = vm.regions();

        let backing = Backing::Direct { phys: pool + page * PAGE_SIZE };
        let size = pages as u64 * PAGE_SIZE;
        let addr = vm.map(&MapRequest::new(backing, size).fixed(slot(at))).unwrap();
        vm.unmap(addr, size).unwrap();

        prop_assert_eq!(vm.regions(), before);
    }

    #[test]
    fn budget_tracks_flexible_bytes(
        policy in arb_policy(),
        ops in proptest::collection::vec(arb_op(), 1..40),
    ) {
        let vm = vm(policy);
        for op in ops {
            let bytes = |pages: usize| pages as u64 * PAGE_SIZE;
            let _ = match op {
                Op::Map { at, pages, prot } => vm.map(&flexible_at(at, pages, prot)).map(drop),
                Op::Unmap { at, pages } => vm.unmap(slot(at), bytes(pages)),
                Op::Protect { at, pages, prot } => vm.protect(slot(at), bytes(pages), prot),
                Op::Name { at, pages } => vm.set_range_name(slot(at), bytes(pages), "n"),
            };
            prop_assert_eq!(flexible_bytes(&vm), vm.flexible_used());
            let map = vm.regions();
            prop_assert!(map.0.windows(2).all(|w| w[0].end <= w[1].start));
        }
        vm.unmap(slot(0), SLOTS as u64 * PAGE_SIZE).unwrap();
        prop_assert_eq!(vm.flexible_used(), 0);
        prop_assert!(vm.regions().0.is_empty());
    }

    #[test]
    fn interior_protect_yields_three_regions(
        policy in arb_policy(),
        (pages, start, len) in arb_interior(),
    ) {
        let vm = vm(policy);
        vm.map(&flexible_at(0, pages, Protection::READ_WRITE)).unwrap();
        vm.protect(slot(start), len as u64 * PAGE_SIZE, Protection::READ).unwrap();

        let bounds: Vec<_> = vm.regions().0.iter().map(|r| (r.start, r.end)).collect();
        prop_assert_eq!(
            bounds,
            vec![
                (slot(0), slot(start)),
                (slot(start), slot(start + len)),
                (slot(start + len), slot(pages)),
            ]
        );
    }
}
