//! Property tests for batch planning and the overlay computer

use std::collections::HashSet;

use geo::{polygon, Area, Geometry};
use overlay_engine::batch::{BatchId, BatchPlanner, BatchSizing};
use overlay_engine::overlay::{GeometryOverlay, Operation, OverlayComputer};
use proptest::prelude::*;

proptest! {
    #[test]
    fn plan_partitions_pair_space(
        targets in 0usize..40,
        masks in 0usize..40,
        max_pairs in 1usize..50,
    ) {
        let spans = BatchPlanner
            .plan(targets, masks, BatchSizing::MaxPairs(max_pairs))
            .expect("valid sizing");

        let mut seen = HashSet::new();
        for (i, span) in spans.iter().enumerate() {
            prop_assert_eq!(span.id, BatchId(i));
            prop_assert!(span.pair_count() >= 1);
            prop_assert!(span.pair_count() <= max_pairs as u64);
            for pair in span.pairs() {
                prop_assert!(pair.target_index < targets && pair.mask_index < masks);
                prop_assert!(seen.insert(pair), "pair {:?} planned twice", pair);
            }
        }
        prop_assert_eq!(seen.len(), targets * masks);
        prop_assert!(spans.len() as u64 >= ((targets * masks) as u64).div_ceil(max_pairs as u64));
    }

    #[test]
    fn worker_sizing_partitions_pair_space(
        targets in 1usize..30,
        masks in 1usize..30,
        workers in 1usize..9,
        per_worker in 1usize..6,
    ) {
        let sizing = BatchSizing::Workers { workers, batches_per_worker: per_worker };
        let spans = BatchPlanner.plan(targets, masks, sizing).expect("valid sizing");
        let covered: u64 = spans.iter().map(|s| s.pair_count()).sum();
        prop_assert_eq!(covered, (targets * masks) as u64);
    }

    #[test]
    fn overlay_is_deterministic(
        x in -5.0f64..5.0,
        y in -5.0f64..5.0,
        size in 0.5f64..4.0,
    ) {
        let target = Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0), (x: 3.0, y: 0.0), (x: 3.0, y: 3.0), (x: 0.0, y: 3.0),
        ]);
        let mask = Geometry::Polygon(polygon![
            (x: x, y: y), (x: x + size, y: y), (x: x + size, y: y + size), (x: x, y: y + size),
        ]);

        for operation in [Operation::Intersection, Operation::Difference] {
            let first = GeometryOverlay.compute(&target, &mask, operation).expect("valid input");
            let second = GeometryOverlay.compute(&target, &mask, operation).expect("valid input");
            prop_assert_eq!(first.is_some(), second.is_some());
            if let (Some(a), Some(b)) = (first, second) {
                prop_assert!((a.unsigned_area() - b.unsigned_area()).abs() < 1e-9);
            }
        }
    }
}

#[test]
fn three_by_two_with_hint_of_two() {
    let spans = BatchPlanner
        .plan(3, 2, BatchSizing::MaxPairs(2))
        .expect("valid sizing");
    assert!(spans.len() >= 3);
    assert_eq!(spans.iter().map(|s| s.pair_count()).sum::<u64>(), 6);
}
