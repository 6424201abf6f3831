//! Property tests for the resource primitives' invariants (spec.md §8):
//! a `BoundedCounter` never exceeds its capacity or drops below zero, and
//! a scheduler run is deterministic under a fixed seed.

use blocksim::resources::BoundedCounter;
use blocksim::sim::{Scheduler, Until};
use proptest::prelude::*;

proptest! {
    #[test]
    fn try_get_never_drives_level_out_of_bounds(
        capacity in 0u64..10_000,
        initial in 0u64..10_000,
        gets in proptest::collection::vec(0u64..2_000, 0..30),
    ) {
        let counter = BoundedCounter::new(capacity, initial.min(capacity));
        for n in gets {
            let before = counter.level();
            if counter.try_get(n) {
                prop_assert_eq!(counter.level(), before - n);
            } else {
                prop_assert_eq!(counter.level(), before);
            }
            prop_assert!(counter.level() <= counter.capacity());
        }
    }

    #[test]
    fn put_never_exceeds_capacity(
        capacity in 1u64..10_000,
        puts in proptest::collection::vec(0u64..5_000, 0..30),
    ) {
        let counter = BoundedCounter::new(capacity, 0);
        for n in puts {
            counter.put(n);
            prop_assert!(counter.level() <= capacity);
        }
    }

    #[test]
    fn get_then_put_is_a_no_op_on_level(
        capacity in 1u64..10_000,
        n in 0u64..10_000,
    ) {
        let n = n.min(capacity);
        let counter = BoundedCounter::new(capacity, capacity);
        prop_assert!(counter.try_get(n));
        counter.put(n);
        prop_assert_eq!(counter.level(), capacity);
    }

    #[test]
    fn a_fixed_seed_reproduces_the_same_finish_time(seed in 0u64..1_000_000) {
        let run = || {
            let sched = Scheduler::new(seed);
            let handle = sched.spawn(move |ctx| async move {
                for i in 1..=5u64 {
                    let _ = ctx.timeout(ctx.uniform01() * i as f64).await;
                }
            });
            sched.run(Until::Sentinel(handle.id())).unwrap()
        };
        prop_assert_eq!(run(), run());
    }
}
