// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::pin::Pin;
use core::ptr::NonNull;

use pin_project::{pin_project, pinned_drop};

use crate::entry::{Callback, Entry};
use crate::TimerWheel;

/// A receiver bound to a [`BoundTimerEvent`].
///
/// This is the "member-operation" callback flavor spec.md §4.1/§9
/// describes as an alternative to a general callable: the event carries a
/// back-reference to some `R` and fires by calling `R::on_timer` rather
/// than invoking a stored closure. The usual shape (per spec.md §9) is a
/// `BoundTimerEvent` embedded as a field of `R` itself, so that `R`'s own
/// destruction cancels the event before `R` goes away.
pub trait TimerCallback {
    /// Invoked when this receiver's bound timer fires.
    fn on_timer(&mut self);
}

/// A scheduled callback bound to at most one [`TimerWheel`] slot
/// (spec.md §4.1).
///
/// `TimerEvent` owns a closure `F` inline — no allocation, no vtable
/// beyond the type-erased [`Callback`] installed into its [`Entry`] at
/// schedule time. It is created **inactive** and becomes **scheduled**
/// only once passed to [`TimerWheel::schedule`] via
/// [`TimerEvent::schedule`]; dropping it while scheduled cancels it first,
/// matching the teacher's `Sleep`'s `PinnedDrop` (`time/sleep.rs`).
#[pin_project(PinnedDrop)]
pub struct TimerEvent<F> {
    #[pin]
    entry: Entry,
    wheel: Option<NonNull<TimerWheel>>,
    callback: F,
}

// Safety: a `TimerEvent` is only ever touched from the single thread that
// owns its `TimerWheel` (spec.md §5); it holds no thread-specific state
// itself.
unsafe impl<F> Send for TimerEvent<F> where F: Send {}

impl<F> TimerEvent<F>
where
    F: FnMut(),
{
    /// Creates an inactive event wrapping `callback`.
    #[must_use]
    pub const fn new(callback: F) -> Self {
        Self {
            entry: Entry::new(),
            wheel: None,
            callback,
        }
    }

    /// Schedules this event on `wheel`, `delay` ticks from `wheel.now()`
    /// (spec.md §4.3.1).
    ///
    /// If already scheduled (on this wheel or another), it is cancelled
    /// first, per spec.md §7's implicit-reschedule rule.
    ///
    /// # Panics
    ///
    /// See [`TimerWheel::schedule`].
    pub fn schedule(self: Pin<&mut Self>, wheel: &mut TimerWheel, delay: u64) {
        let mut this = self.project();

        if this.entry.active() {
            cancel_via(*this.wheel, this.entry.as_mut());
        }

        // Safety: `data` points at `this.callback`, which lives inside this
        // same `TimerEvent`; the event is pinned for as long as it may be
        // scheduled, so the pointer stays valid until `cancel`/drop.
        let callback = unsafe {
            Callback::new(
                NonNull::from(&mut *this.callback).cast().as_ptr(),
                call_closure::<F>,
            )
        };
        // Safety: installing the callback is a plain field write; it does
        // not move the entry.
        unsafe { this.entry.as_mut().get_mut_unchecked() }.callback = callback;
        *this.wheel = Some(NonNull::from(&*wheel));
        wheel.schedule(this.entry, delay);
    }

    /// Cancels this event. A no-op if it is not currently scheduled
    /// (spec.md §4.1).
    pub fn cancel(self: Pin<&mut Self>) {
        let this = self.project();
        cancel_via(*this.wheel, this.entry);
    }

    /// Reschedules this event `delay` ticks from `now()` of whichever
    /// wheel it was last scheduled on, without requiring a `&mut
    /// TimerWheel` at the call site.
    ///
    /// This is what makes self-rescheduling timers, and timers rescheduled
    /// *by another event's callback* during `advance`, possible: the
    /// wheel is already mutably borrowed by the in-progress `advance` call,
    /// so no fresh `&mut TimerWheel` can be obtained from inside a
    /// callback. The event instead carries the raw pointer it captured the
    /// first time it was scheduled (spec.md §4.3.2, §9).
    ///
    /// # Panics
    ///
    /// Panics if this event has never been scheduled on any wheel.
    pub fn reschedule_self(self: Pin<&mut Self>, delay: u64) {
        let this = self.project();
        let mut wheel = this
            .wheel
            .expect("reschedule_self: event has never been scheduled on a wheel");
        // Safety: the wheel this event was last scheduled on outlives the
        // event (spec.md §3's TimerWheel lifecycle).
        unsafe { wheel.as_mut() }.schedule(this.entry, delay);
    }

    /// True iff this event is currently scheduled.
    #[inline]
    #[must_use]
    pub fn active(&self) -> bool {
        self.entry.active()
    }

    /// The absolute tick this event is due at, if scheduled.
    #[inline]
    #[must_use]
    pub fn scheduled_at(&self) -> Option<u64> {
        self.entry.scheduled_at()
    }
}

#[pinned_drop]
impl<F> PinnedDrop for TimerEvent<F> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        cancel_via(*this.wheel, this.entry);
    }
}

impl<F> fmt::Debug for TimerEvent<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEvent").field("entry", &self.entry).finish_non_exhaustive()
    }
}

/// A scheduled callback bound to a receiver's [`TimerCallback::on_timer`]
/// (spec.md §4.1's "bound-member" flavor).
///
/// Unlike [`TimerEvent`], this does not own the receiver: it holds a raw
/// back-reference, matching spec.md §9's guidance that the binding "must
/// not strongly keep the receiver alive" — in practice `BoundTimerEvent`
/// is meant to be embedded as a field of the receiver it targets, so that
/// the receiver's own destruction runs this type's `PinnedDrop` (and thus
/// cancels the event) before the receiver's storage is freed.
#[pin_project(PinnedDrop)]
pub struct BoundTimerEvent<R> {
    #[pin]
    entry: Entry,
    wheel: Option<NonNull<TimerWheel>>,
    receiver: NonNull<R>,
}

// Safety: see `TimerEvent`.
unsafe impl<R> Send for BoundTimerEvent<R> where R: Send {}

impl<R> BoundTimerEvent<R>
where
    R: TimerCallback,
{
    /// Creates an inactive event bound to `receiver`.
    ///
    /// # Safety
    ///
    /// `receiver` must remain valid and must not move for as long as this
    /// event may be scheduled (i.e. until it is cancelled or dropped). The
    /// intended usage is to embed this event as a field of `*receiver`
    /// itself, pin the containing value, and take `receiver` from that
    /// pinned reference.
    #[must_use]
    pub const unsafe fn new(receiver: NonNull<R>) -> Self {
        Self {
            entry: Entry::new(),
            wheel: None,
            receiver,
        }
    }

    /// Schedules this event on `wheel`, `delay` ticks from `wheel.now()`.
    ///
    /// # Panics
    ///
    /// See [`TimerWheel::schedule`].
    pub fn schedule(self: Pin<&mut Self>, wheel: &mut TimerWheel, delay: u64) {
        let mut this = self.project();

        if this.entry.active() {
            cancel_via(*this.wheel, this.entry.as_mut());
        }

        // Safety: `receiver` is guaranteed valid and non-moving for as long
        // as this event may be scheduled, per `BoundTimerEvent::new`'s
        // contract.
        let callback = unsafe { Callback::new(this.receiver.cast().as_ptr(), call_bound::<R>) };
        // Safety: installing the callback is a plain field write; it does
        // not move the entry.
        unsafe { this.entry.as_mut().get_mut_unchecked() }.callback = callback;
        *this.wheel = Some(NonNull::from(&*wheel));
        wheel.schedule(this.entry, delay);
    }

    /// Cancels this event. A no-op if it is not currently scheduled.
    pub fn cancel(self: Pin<&mut Self>) {
        let this = self.project();
        cancel_via(*this.wheel, this.entry);
    }

    /// Reschedules this event `delay` ticks from `now()` of whichever
    /// wheel it was last scheduled on. See
    /// [`TimerEvent::reschedule_self`] for why this exists.
    ///
    /// # Panics
    ///
    /// Panics if this event has never been scheduled on any wheel.
    pub fn reschedule_self(self: Pin<&mut Self>, delay: u64) {
        let this = self.project();
        let mut wheel = this
            .wheel
            .expect("reschedule_self: event has never been scheduled on a wheel");
        // Safety: see `TimerEvent::reschedule_self`.
        unsafe { wheel.as_mut() }.schedule(this.entry, delay);
    }

    /// True iff this event is currently scheduled.
    #[inline]
    #[must_use]
    pub fn active(&self) -> bool {
        self.entry.active()
    }

    /// The absolute tick this event is due at, if scheduled.
    #[inline]
    #[must_use]
    pub fn scheduled_at(&self) -> Option<u64> {
        self.entry.scheduled_at()
    }
}

#[pinned_drop]
impl<R> PinnedDrop for BoundTimerEvent<R> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        cancel_via(*this.wheel, this.entry);
    }
}

impl<R> fmt::Debug for BoundTimerEvent<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundTimerEvent").field("entry", &self.entry).finish_non_exhaustive()
    }
}

/// Cancels `entry` through `wheel`, if both are present and `entry` is
/// active. Shared by `cancel()` and both `PinnedDrop` impls.
fn cancel_via(wheel: Option<NonNull<TimerWheel>>, entry: Pin<&mut Entry>) {
    if !entry.active() {
        return;
    }
    let Some(mut wheel) = wheel else {
        return;
    };
    // Safety: `wheel` was captured from a live `&mut TimerWheel` at
    // schedule time and the wheel does not move or get dropped while any
    // event scheduled on it still exists (spec.md §3's TimerWheel
    // lifecycle: the wheel is destroyed only once no event references its
    // slots).
    unsafe { wheel.as_mut().cancel(entry) };
}

unsafe fn call_closure<F: FnMut()>(data: *mut ()) {
    // Safety: installed by `TimerEvent::schedule`, pointing at the `F`
    // embedded in this same, still-pinned `TimerEvent`.
    let f = unsafe { &mut *data.cast::<F>() };
    f();
}

unsafe fn call_bound<R: TimerCallback>(data: *mut ()) {
    // Safety: installed by `BoundTimerEvent::schedule` from a `NonNull<R>`
    // the caller promised stays valid for as long as the event may fire.
    let r = unsafe { &mut *data.cast::<R>() };
    r.on_timer();
}
