// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::pin::Pin;
use core::ptr::NonNull;

use cordyceps::List;

use crate::entry::Entry;
use crate::wheel::Wheel;
use crate::{BITS_PER_LEVEL, DEPTH, WIDTH};

/// A hierarchical timer wheel (spec.md §4.3).
///
/// `TimerWheel` owns `DEPTH` rings of `WIDTH` slots each and a logical
/// clock, `now`. It does not own the [`TimerEvent`](crate::TimerEvent)s
/// scheduled on it — those remain the caller's to store, and must not move
/// or be dropped while linked in (enforced by `schedule`/`cancel` taking
/// `Pin<&mut Entry>`).
///
/// This is a direct generalization of the teacher's `kasync::time::timer`
/// module: the cascade/dispatch algorithm (`Core::poll`, steal-before-fire,
/// bounded reinsertion) is unchanged, but the live `Clock`/`Waker` plumbing
/// is gone — `advance` takes an explicit tick count from the host instead of
/// reading a hardware clock, and firing an entry calls its stored callback
/// directly rather than waking a future.
pub struct TimerWheel {
    now: u64,
    wheels: [Wheel; DEPTH],
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    /// Creates a wheel with `now() == 0`.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_now(0)
    }

    /// Creates a wheel starting at an explicit `now`.
    #[must_use]
    pub const fn with_now(now: u64) -> Self {
        Self {
            now,
            wheels: [
                Wheel::new(0),
                Wheel::new(1),
                Wheel::new(2),
                Wheel::new(3),
                Wheel::new(4),
                Wheel::new(5),
                Wheel::new(6),
                Wheel::new(7),
            ],
        }
    }

    #[inline]
    #[must_use]
    pub const fn now(&self) -> u64 {
        self.now
    }

    /// Schedules `entry` to fire `delay` ticks from now (spec.md §4.3.1).
    ///
    /// If `entry` is already scheduled it is cancelled first (implicit
    /// reschedule, spec.md §7).
    ///
    /// # Panics
    ///
    /// Panics if `delay == 0` or if `now() + delay` overflows `u64`.
    pub fn schedule(&mut self, mut entry: Pin<&mut Entry>, delay: u64) {
        assert!(delay >= 1, "schedule: delay must be at least 1 tick");

        if entry.active() {
            // Safety: `entry` is linked (we just checked `active()`), and we
            // hold the only `&mut` access to it.
            unsafe { self.cancel_inner(entry.as_mut()) };
        }

        // `now + delay` overflowing `u64` is the only way to exceed the
        // horizon, since `WIDTH.pow(DEPTH) - 1 == u64::MAX` for this
        // wheel's parameters; the `checked_add` above already rejects it.
        let deadline = self
            .now
            .checked_add(delay)
            .expect("schedule: now + delay overflowed u64");

        tracing::trace!(now = self.now, delay, deadline, "scheduling entry");
        self.insert_at(deadline, entry);
    }

    /// Schedules `entry` to fire at some unspecified tick within
    /// `[now() + min_delay, now() + max_delay]` (spec.md §6).
    ///
    /// Picks the coarsest wheel level whose slot covers the whole window, so
    /// that events with overlapping windows are likely to land in (and thus
    /// be dispatched together from) the same slot.
    ///
    /// # Panics
    ///
    /// Panics if `min_delay > max_delay`, `min_delay == 0`, or the window
    /// extends past the wheel's horizon.
    pub fn schedule_in_range(&mut self, mut entry: Pin<&mut Entry>, min_delay: u64, max_delay: u64) {
        assert!(min_delay >= 1, "schedule_in_range: min_delay must be at least 1 tick");
        assert!(min_delay <= max_delay, "schedule_in_range: min_delay must not exceed max_delay");

        if entry.active() {
            // Safety: see `schedule`.
            unsafe { self.cancel_inner(entry.as_mut()) };
        }

        let lo = self
            .now
            .checked_add(min_delay)
            .expect("schedule_in_range: now + min_delay overflowed u64");
        let hi = self
            .now
            .checked_add(max_delay)
            .expect("schedule_in_range: now + max_delay overflowed u64");

        let level = (0..DEPTH)
            .rev()
            .find(|&level| {
                let shift = shift_for_level(level);
                (lo >> shift) == (hi >> shift)
            })
            .unwrap_or(0);

        tracing::trace!(now = self.now, min_delay, max_delay, level, "scheduling in range");
        // Safety: `entry` was pinned by the caller; this only extracts the
        // pointer, it does not move the pointee.
        let ptr = NonNull::from(unsafe { Pin::into_inner_unchecked(entry) });
        self.link_ptr(hi, level, ptr);
    }

    fn insert_at(&mut self, deadline: u64, entry: Pin<&mut Entry>) {
        let level = level_for_deadline(self.now, deadline);
        // Safety: see `schedule_in_range`.
        let ptr = NonNull::from(unsafe { Pin::into_inner_unchecked(entry) });
        self.link_ptr(deadline, level, ptr);
    }

    fn link_ptr(&mut self, deadline: u64, level: usize, ptr: NonNull<Entry>) {
        // Safety: `ptr` came from a `Pin<&mut Entry>` the caller is about to
        // stop touching directly; the entry will not move while linked.
        unsafe {
            let entry = ptr.as_ptr();
            (*entry).deadline = deadline;
            (*entry).level = level;
            (*entry).active = true;
        }
        self.wheels[level].insert(deadline, ptr);
    }

    /// Cancels `entry`. A no-op if it is not currently scheduled.
    ///
    /// Idempotent: calling `cancel` on an already-inactive entry does
    /// nothing (spec.md §4.1).
    pub fn cancel(&mut self, entry: Pin<&mut Entry>) {
        if !entry.active() {
            return;
        }
        // Safety: `entry` is linked (just checked).
        unsafe { self.cancel_inner(entry) }
    }

    /// # Safety
    ///
    /// `entry` must currently be linked into this wheel.
    unsafe fn cancel_inner(&mut self, mut entry: Pin<&mut Entry>) {
        let deadline = entry.deadline;
        let level = entry.level;
        tracing::trace!(deadline, level, "cancelling entry");
        // Safety: caller guarantees `entry` is linked into this wheel, at the
        // slot implied by its recorded deadline and level.
        unsafe { self.wheels[level].remove(deadline, entry.as_mut()) };
        // Safety: flipping `active` does not move the entry.
        unsafe { entry.get_mut_unchecked() }.active = false;
    }

    /// Advances the logical clock by `ticks`, dispatching every event whose
    /// deadline is now `<= now()` (spec.md §4.3.2).
    ///
    /// Returns the number of callbacks invoked.
    ///
    /// # Panics
    ///
    /// Panics if `now() + ticks` overflows `u64`, or if a dispatched
    /// callback panics (the wheel is left in a consistent state: the firing
    /// entry is already unlinked, and entries later in the same slot's
    /// dispatch batch are left un-dispatched, per spec.md §7's "propagate"
    /// policy).
    pub fn advance(&mut self, ticks: u64) -> usize {
        let target = self
            .now
            .checked_add(ticks)
            .expect("advance: now + ticks overflowed u64");
        let expired = self.poll(target);
        self.now = target;
        expired
    }

    /// Drives the wheel forward to `target`, firing and cascading as needed.
    ///
    /// This is the direct port of the teacher's `Core::poll`: it repeatedly
    /// takes the next non-empty slot whose range has been reached, firing
    /// entries due exactly now and deferring reinsertion of entries that
    /// were only in that slot because a coarser level holds them loosely
    /// (the cascade). Deferred entries are collected across the whole walk
    /// and reinserted once, after `self.now` reflects `target`, so that a
    /// single big jump cascades each touched slot exactly once.
    fn poll(&mut self, target: u64) -> usize {
        let mut pending_reschedule = List::<Entry>::new();
        let mut expired = 0;

        while let Some((level, boundary)) = self.next_deadline() {
            if boundary > target {
                break;
            }

            self.now = boundary;
            let slot = self.wheels[level].slot_index(boundary);
            let stolen = self.wheels[level].take_slot(slot);
            tracing::trace!(level, slot, boundary, "cascading slot");

            for ptr in stolen {
                // Safety: `ptr` just came off of a wheel list; nothing else
                // can be touching it, and it outlives this scope (the caller
                // of `schedule` promised as much).
                let entry_deadline = unsafe { (*ptr.as_ptr()).deadline };

                // Compare against `target`, not the progressively-advancing
                // `self.now`: a coarse slot's boundary can fall short of
                // `target` while still holding entries that are genuinely
                // due by `target`, and those must fire now rather than be
                // deferred to a future `advance` call.
                if entry_deadline > target {
                    debug_assert_ne!(level, 0, "a level-0 entry cannot need rescheduling");
                    pending_reschedule.push_front(ptr);
                } else {
                    expired += 1;
                    // A coarser-level entry's own deadline can be later than
                    // its slot's boundary; a callback reading `now()` (e.g.
                    // via `reschedule_self`) during dispatch must see at
                    // least its own deadline, or it would compute a new
                    // deadline that still falls within this same `advance`.
                    self.now = self.now.max(entry_deadline);
                    // Safety: `ptr` is a live, unlinked `Entry`; pinning it
                    // here is sound because it has not moved since it was
                    // constructed and `fire` does not move it either.
                    let mut pinned = unsafe { Pin::new_unchecked(&mut *ptr.as_ptr()) };
                    // Safety: just unlinked from `stolen`, not linked
                    // anywhere else.
                    unsafe { pinned.as_mut().fire() };
                }
            }
        }

        self.now = target;

        for ptr in pending_reschedule {
            // Safety: see above; these entries were just taken off of a
            // slot and are not linked anywhere.
            let deadline = unsafe { (*ptr.as_ptr()).deadline };
            debug_assert!(deadline > self.now);
            let level = level_for_deadline(self.now, deadline);
            self.link_ptr(deadline, level, ptr);
        }

        expired
    }

    /// The nearest upcoming slot boundary across all levels, scanning
    /// coarser levels only once the finer ones are exhausted (spec.md
    /// §4.3.3's ordering requirement, reused here for cascade detection).
    fn next_deadline(&self) -> Option<(usize, u64)> {
        self.wheels.iter().enumerate().find_map(|(level, wheel)| {
            let start_offset = u64::from(level == 0);
            wheel
                .next_slot_boundary(self.now, start_offset)
                .map(|boundary| (level, boundary))
        })
    }

    /// Returns the number of ticks until the next scheduled event, capped at
    /// `max` (spec.md §4.3.3).
    ///
    /// Returns `max` if no event is scheduled within `max` ticks of `now()`
    /// (including if nothing is scheduled at all). `max == 0` always returns
    /// `0` unconditionally (spec.md §9's "open question").
    #[must_use]
    pub fn ticks_to_next_event(&self, max: u64) -> u64 {
        if max == 0 {
            return 0;
        }

        for (level, wheel) in self.wheels.iter().enumerate() {
            let start_offset = u64::from(level == 0);
            if let Some(delay) = self.scan_level(wheel, level, start_offset, max) {
                return delay.min(max);
            }
        }

        max
    }

    fn scan_level(&self, wheel: &Wheel, level: usize, start_offset: u64, max: u64) -> Option<u64> {
        let shift = shift_for_level(level);
        let unit = 1u64 << shift;
        let now_index = wheel.slot_index(self.now);
        let base = (self.now >> shift) << shift;

        for offset in start_offset..u64::try_from(WIDTH).expect("WIDTH fits u64") {
            let slot_start = base.checked_add(offset.checked_mul(unit)?)?;
            if slot_start.saturating_sub(self.now) > max {
                return None;
            }

            let offset_idx = usize::try_from(offset).expect("offset < WIDTH fits usize");
            let idx = (now_index + offset_idx) & (WIDTH - 1);
            if wheel.slot_is_empty(idx) {
                continue;
            }

            if level == 0 {
                return Some(offset);
            }

            // Coarser levels only bound the slot's range; the exact minimum
            // deadline must be found by scanning its entries (spec.md
            // §4.3.3's "correctness subtlety"). This scan only finds the true
            // nearest event because `level_for_deadline` guarantees a lower
            // level never holds an entry farther than one a higher level
            // holds: once a level is found non-empty, no level below it can
            // contain anything nearer, so the outer loop can stop here.
            let min = wheel
                .slot(idx)
                .iter()
                .map(|entry| entry.deadline - self.now)
                .min()
                .expect("non-empty slot must have a minimum deadline");
            return Some(min);
        }

        None
    }
}

/// The number of bits `level` full levels below the top shift past:
/// `level * BITS_PER_LEVEL`, always small enough to fit `u32` since
/// `level < DEPTH <= 8` and `BITS_PER_LEVEL == 8`.
#[inline]
#[allow(clippy::cast_possible_truncation, reason = "level * BITS_PER_LEVEL <= 56, always fits u32")]
fn shift_for_level(level: usize) -> u32 {
    (level * BITS_PER_LEVEL) as u32
}

/// The wheel level `deadline` belongs on, given the clock is currently at
/// `now` (spec.md §4.3.1).
///
/// This is **not** a function of the raw delay `deadline - now` alone: it is
/// the highest bit position at which `now` and `deadline` differ, divided
/// down into one of `DEPTH` levels of `BITS_PER_LEVEL` bits each. Two
/// deadlines the same distance from two different `now`s can therefore land
/// on different levels, and that is the point — a level only ever holds
/// deadlines that still agree with `now` on every bit above that level's own
/// granularity, which is exactly the invariant `poll`'s cascade and
/// `ticks_to_next_event`'s level-by-level scan both depend on (a lower level
/// is always at least as near as every higher one). Placing purely by delay
/// magnitude breaks that invariant: an event scheduled long ago whose
/// deadline has since crossed a level boundary without being cascaded can
/// still be nearer than one just scheduled with a smaller raw delay. This
/// mirrors the teacher's `wheel_index` (`time/timer.rs`), generalized to
/// take an explicit `now` rather than reading `self.now`, since `poll`'s
/// reinsertion loop must recompute it against the now-advanced clock.
pub(crate) fn level_for_deadline(now: u64, deadline: u64) -> usize {
    debug_assert!(deadline > now, "level_for_deadline: deadline must be strictly after now");
    let mask = u64::try_from(WIDTH - 1).expect("WIDTH fits u64");
    let differing = (now ^ deadline) | mask;
    let bits = u64::BITS - differing.leading_zeros();
    let bits = usize::try_from(bits - 1).expect("bit index fits usize");
    (bits / BITS_PER_LEVEL).min(DEPTH - 1)
}
