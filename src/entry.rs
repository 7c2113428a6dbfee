// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::marker::PhantomPinned;
use core::ptr::{self, NonNull};

use cordyceps::{Linked, list};

/// A callback, type-erased to a `(data pointer, call function)` pair.
///
/// This is the same vtable idiom the teacher crate uses for its own
/// type-erased `Clock` (`time/clock.rs`'s `RawClock`/`RawClockVTable`): a
/// data pointer plus a single function pointer that knows how to interpret
/// it. It lets a single intrusive list hold entries whose callbacks are of
/// different concrete types (a plain closure, or a receiver + member
/// function) without requiring an allocation or a trait object.
#[derive(Clone, Copy)]
pub(crate) struct Callback {
    data: *mut (),
    call: unsafe fn(*mut ()),
}

impl Callback {
    pub(crate) const fn dangling() -> Self {
        unsafe fn noop(_data: *mut ()) {}
        Self {
            data: ptr::null_mut(),
            call: noop,
        }
    }

    /// # Safety
    ///
    /// `data` must remain a valid argument for `call` for as long as this
    /// `Callback` may be invoked (i.e. until the owning [`Entry`] is fired
    /// or cancelled).
    pub(crate) const unsafe fn new(data: *mut (), call: unsafe fn(*mut ())) -> Self {
        Self { data, call }
    }

    /// Invokes the callback.
    ///
    /// # Safety
    ///
    /// The data pointer installed in this `Callback` must still be valid.
    pub(crate) unsafe fn call(self) {
        // Safety: upheld by `Callback::new`'s caller.
        unsafe { (self.call)(self.data) }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").field("data", &self.data).finish_non_exhaustive()
    }
}

/// An entry in a timer wheel slot.
///
/// This is the intrusive node the wheel actually links into its ring
/// buffers (spec.md §4.1/§4.2/§9): it carries the scheduled deadline, the
/// type-erased callback, and the doubly-linked list links cordyceps needs
/// to thread it into a [`cordyceps::List`]. Public wrapper types
/// ([`crate::TimerEvent`], [`crate::BoundTimerEvent`]) embed an `Entry` and
/// fill in its callback at schedule time.
pub struct Entry {
    pub(crate) deadline: u64,
    /// The wheel level this entry is currently linked into. Recorded at
    /// insertion time rather than recomputed from `deadline - now`, since
    /// `now` may have advanced past the entry's original schedule time
    /// without a cascade having moved it yet, which would make the
    /// recomputed level disagree with where the entry actually lives.
    pub(crate) level: usize,
    pub(crate) active: bool,
    pub(crate) callback: Callback,
    links: list::Links<Entry>,
    _pin: PhantomPinned,
}

impl Entry {
    pub(crate) const fn new() -> Self {
        Self {
            deadline: 0,
            level: 0,
            active: false,
            callback: Callback::dangling(),
            links: list::Links::new(),
            _pin: PhantomPinned,
        }
    }

    #[inline]
    pub(crate) fn active(&self) -> bool {
        self.active
    }

    #[inline]
    pub(crate) fn scheduled_at(&self) -> Option<u64> {
        self.active.then_some(self.deadline)
    }

    /// Grants plain mutable access to fields that do not affect this
    /// entry's address (`active`, `deadline`, `callback`) without moving
    /// the pinned value itself.
    ///
    /// # Safety
    ///
    /// The caller must not move out of the returned reference.
    #[inline]
    pub(crate) unsafe fn get_mut_unchecked(self: core::pin::Pin<&mut Self>) -> &mut Self {
        // Safety: upheld by this function's own contract.
        unsafe { core::pin::Pin::get_unchecked_mut(self) }
    }

    /// Unlinks this entry and invokes its callback.
    ///
    /// # Safety
    ///
    /// Must only be called on an entry that has just been taken off of a
    /// wheel slot's list (i.e. it is no longer linked anywhere).
    pub(crate) unsafe fn fire(self: core::pin::Pin<&mut Self>) {
        // Safety: flipping `active` does not move the entry.
        let this = unsafe { self.get_mut_unchecked() };
        this.active = false;
        let callback = this.callback;
        // Safety: caller's responsibility; the callback's data pointer was
        // installed by a `TimerEvent`/`BoundTimerEvent` that is still alive
        // (the wheel never outlives the event without the event cancelling
        // itself first).
        unsafe { callback.call() }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("deadline", &self.deadline)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

// Safety: `Entry` does not move while linked (callers must keep it pinned
// for as long as it is scheduled; `TimerWheel::schedule`/`cancel` take
// `Pin<&mut _>` to enforce this), and `Handle = NonNull<Entry>` does not
// claim ownership, matching the teacher's `time/timer/entry.rs`.
unsafe impl Linked<list::Links<Entry>> for Entry {
    type Handle = NonNull<Entry>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(target: NonNull<Self>) -> NonNull<list::Links<Self>> {
        // Safety: using `addr_of_mut!` avoids creating an intermediate
        // reference to a possibly-not-yet-initialized field, per cordyceps's
        // own `Linked` docs.
        let links = unsafe { ptr::addr_of_mut!((*target.as_ptr()).links) };
        // Safety: derived from a `NonNull`, so it cannot be null.
        unsafe { NonNull::new_unchecked(links) }
    }
}
