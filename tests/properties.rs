// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The numbered invariant properties from spec.md §8, run through `proptest`
//! in the same `Strategy`-builder style as `range-tree/tests/proptest.rs`.

use std::cell::Cell;
use std::pin::{pin, Pin};
use std::ptr::NonNull;

use proptest::prelude::*;
use timer_wheel::{TimerEvent, TimerWheel};

/// Property 1: `schedule(e, d)` then `advance(d)` fires exactly once.
#[test]
fn fires_exactly_once_at_its_deadline() {
    proptest!(|(delay in 1u64..1_000_000)| {
        let fired = Cell::new(0u32);
        let mut wheel = TimerWheel::new();
        let mut event = pin!(TimerEvent::new(|| fired.set(fired.get() + 1)));
        event.as_mut().schedule(&mut wheel, delay);
        wheel.advance(delay);
        prop_assert_eq!(fired.get(), 1);
    });
}

/// Property 2: one tick short of the deadline, nothing fires; the next
/// single tick fires it.
#[test]
fn does_not_fire_before_its_deadline() {
    proptest!(|(delay in 1u64..1_000_000)| {
        let fired = Cell::new(0u32);
        let mut wheel = TimerWheel::new();
        let mut event = pin!(TimerEvent::new(|| fired.set(fired.get() + 1)));
        event.as_mut().schedule(&mut wheel, delay);

        wheel.advance(delay - 1);
        prop_assert_eq!(fired.get(), 0);

        wheel.advance(1);
        prop_assert_eq!(fired.get(), 1);
    });
}

/// Property 3: cancelling before the deadline suppresses dispatch entirely.
#[test]
fn cancel_before_deadline_suppresses_dispatch() {
    proptest!(|(delay in 1u64..1_000_000, extra in 0u64..1_000_000)| {
        let fired = Cell::new(false);
        let mut wheel = TimerWheel::new();
        let mut event = pin!(TimerEvent::new(|| fired.set(true)));
        event.as_mut().schedule(&mut wheel, delay);
        event.as_mut().cancel();

        wheel.advance(delay + extra);
        prop_assert!(!fired.get());
    });
}

/// Property 4: cancelling an already-inactive event is a no-op, not a panic
/// or a second effect.
#[test]
fn double_cancel_is_idempotent() {
    proptest!(|(delay in 1u64..1_000_000)| {
        let fired = Cell::new(false);
        let mut wheel = TimerWheel::new();
        let mut event = pin!(TimerEvent::new(|| fired.set(true)));
        event.as_mut().schedule(&mut wheel, delay);
        event.as_mut().cancel();
        event.as_mut().cancel();
        prop_assert!(!event.active());

        wheel.advance(delay);
        prop_assert!(!fired.get());
    });
}

/// Property 5: rescheduling before the first deadline elapses yields exactly
/// one firing, at the second deadline.
#[test]
fn reschedule_before_firing_replaces_the_deadline() {
    proptest!(|(delay1 in 2u64..1_000_000, delay2 in 1u64..1_000_000, advance_before_raw in 0u64..1_000_000)| {
        let advance_before = advance_before_raw % delay1;
        let fired = Cell::new(0u32);
        let mut wheel = TimerWheel::new();
        let mut event = pin!(TimerEvent::new(|| fired.set(fired.get() + 1)));
        event.as_mut().schedule(&mut wheel, delay1);

        wheel.advance(advance_before);
        event.as_mut().schedule(&mut wheel, delay2);
        let second_deadline = wheel.now() + delay2;

        wheel.advance(second_deadline - wheel.now() - 1);
        prop_assert_eq!(fired.get(), 0);

        wheel.advance(1);
        prop_assert_eq!(fired.get(), 1);

        wheel.advance(1_000_000);
        prop_assert_eq!(fired.get(), 1);
    });
}

/// Property 6: a callback that reschedules itself with delay `k` fires again
/// exactly `k` ticks after the firing that rescheduled it.
#[test]
fn self_reschedule_fires_again_k_ticks_later() {
    // The closure's own type must be nameable to hold a pointer back to its
    // containing event (see `event.rs`'s `Periodic` test type for the same
    // trick with a `BoundTimerEvent`); erasing it to `Box<dyn FnMut()>` sidesteps
    // that without needing a second concrete receiver type just for this test.
    type SelfReschedEvent<'a> = TimerEvent<Box<dyn FnMut() + 'a>>;

    proptest!(|(first_delay in 1u64..1000, k in 1u64..1000)| {
        let runs = Cell::new(0u32);
        let self_ptr: Cell<Option<NonNull<SelfReschedEvent>>> = Cell::new(None);

        let mut wheel = TimerWheel::new();
        let mut event: Pin<Box<SelfReschedEvent>> = Box::pin(TimerEvent::new(Box::new(|| {
            runs.set(runs.get() + 1);
            if let Some(mut ptr) = self_ptr.get() {
                // Safety: `ptr` was set below, right after pinning this same
                // event, to its address; it is never moved afterwards.
                unsafe { Pin::new_unchecked(ptr.as_mut()) }.reschedule_self(k);
            }
        }) as Box<dyn FnMut()>));

        self_ptr.set(Some(NonNull::from(&*event)));
        event.as_mut().schedule(&mut wheel, first_delay);

        wheel.advance(first_delay);
        prop_assert_eq!(runs.get(), 1);

        wheel.advance(k - 1);
        prop_assert_eq!(runs.get(), 1, "must not fire before the self-scheduled delay elapses");

        wheel.advance(1);
        prop_assert_eq!(runs.get(), 2);
    });
}

/// Property 7: `ticks_to_next_event(max)` returns the nearest deadline's
/// distance from `now`, capped at `max`.
#[test]
fn ticks_to_next_event_matches_nearest_deadline() {
    proptest!(|(delays in prop::collection::vec(1u64..2000, 1..20), max in 0u64..2000)| {
        let mut wheel = TimerWheel::new();
        let mut events: Vec<_> = delays.iter().map(|_| Box::pin(TimerEvent::new(|| {}))).collect();
        for (event, &delay) in events.iter_mut().zip(&delays) {
            event.as_mut().schedule(&mut wheel, delay);
        }

        let min_delay = delays.iter().copied().min().unwrap();
        let expected = min_delay.min(max);
        prop_assert_eq!(wheel.ticks_to_next_event(max), expected);
    });
}

/// Property 8: every event ends up in exactly one of "dispatched",
/// "cancelled before firing", or "still active" — the three are disjoint and
/// exhaustive.
#[test]
fn dispatched_cancelled_and_active_counts_partition_scheduled_events() {
    proptest!(|(
        delays in prop::collection::vec(1u64..2000, 1..30),
        cancel_mask in prop::collection::vec(any::<bool>(), 1..30),
        advance_by in 0u64..2000,
    )| {
        let dispatched = Cell::new(0u32);
        let mut wheel = TimerWheel::new();

        let n = delays.len().min(cancel_mask.len());
        let mut events: Vec<_> = delays[..n]
            .iter()
            .map(|_| Box::pin(TimerEvent::new(|| dispatched.set(dispatched.get() + 1))))
            .collect();

        let mut cancelled = 0u32;
        for (event, (&delay, &should_cancel)) in
            events.iter_mut().zip(delays[..n].iter().zip(&cancel_mask[..n]))
        {
            event.as_mut().schedule(&mut wheel, delay);
            if should_cancel {
                event.as_mut().cancel();
                cancelled += 1;
            }
        }

        wheel.advance(advance_by);

        let still_active = u32::try_from(events.iter().filter(|e| e.active()).count()).expect("n fits u32");
        prop_assert_eq!(dispatched.get() + cancelled + still_active, u32::try_from(n).expect("n fits u32"));
    });
}

/// Advances `wheel` one tick at a time up to `target`, checking after every
/// tick that every event whose absolute deadline equals the new `now` has
/// in fact just fired — and, implicitly, that no event fires on any other
/// tick (an event firing early or late would be caught on the tick where the
/// assertion for some *other* deadline runs and this one's slot unexpectedly
/// already holds, or still lacks, a value).
fn advance_and_check_each_deadline(
    wheel: &mut TimerWheel,
    current_tick: &Cell<u64>,
    fired_at: &[Cell<Option<u64>>],
    deadlines: &[u64],
    target: u64,
) {
    while wheel.now() < target {
        let tick = wheel.now() + 1;
        current_tick.set(tick);
        wheel.advance(1);
        for (slot, &deadline) in fired_at.iter().zip(deadlines) {
            if deadline == tick {
                assert_eq!(slot.get(), Some(deadline), "event with deadline {deadline} did not fire at its own tick");
            }
        }
    }
}

/// Property 9: a large batch of randomly-delayed events, advanced tick by
/// tick, each fires in the tick equal to its own deadline — never early,
/// never late, never skipped.
///
/// Events are scheduled in several batches separated by partial advances, so
/// later batches are scheduled from a `now` that has already moved forward —
/// exercising a wheel level chosen from the schedule-time `now`, not from the
/// raw delay alone.
#[test]
fn randomized_batch_fires_each_event_in_its_own_tick() {
    use rand::Rng;

    const COUNT: usize = 10_000;
    const BATCHES: usize = 4;
    const CHUNK: usize = COUNT / BATCHES;
    const STAGGER: u64 = 50;

    let mut rng = rand::thread_rng();
    let current_tick = Cell::new(0u64);
    let fired_at: Vec<Cell<Option<u64>>> = (0..COUNT).map(|_| Cell::new(None)).collect();

    let mut wheel = TimerWheel::new();
    let mut events: Vec<_> = fired_at
        .iter()
        .map(|slot| Box::pin(TimerEvent::new(|| slot.set(Some(current_tick.get())))))
        .collect();
    let mut deadlines = vec![0u64; COUNT];

    for (batch_idx, chunk) in events.chunks_mut(CHUNK).enumerate() {
        let base = batch_idx * CHUNK;
        for (offset, event) in chunk.iter_mut().enumerate() {
            let k = rng.gen_range(0..=20u32);
            let delay = 1 + rng.gen_range(0u64..(1u64 << k));
            event.as_mut().schedule(&mut wheel, delay);
            deadlines[base + offset] = wheel.now() + delay;
        }

        let target = wheel.now() + STAGGER;
        advance_and_check_each_deadline(&mut wheel, &current_tick, &fired_at, &deadlines, target);
    }

    let max_deadline = *deadlines.iter().max().unwrap();
    advance_and_check_each_deadline(&mut wheel, &current_tick, &fired_at, &deadlines, max_deadline);
}

