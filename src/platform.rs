//! Platform abstraction and the critical-section mutex built on it.
//!
//! The stack never touches hardware or interrupt controllers directly.
//! Everything target-specific funnels through the [`Platform`] trait:
//! critical sections, the millisecond clock, and the transmit hook.
//! Associated functions (no `&self`) keep dispatch static — a platform
//! is a type, not an object, and monomorphization erases the
//! indirection.
//!
//! [`CritMutex`] is the only synchronization primitive in the crate.
//! It combines the platform critical section with an atomic lock flag so
//! the same discipline works both on a single-core MCU (where the
//! critical section alone guarantees exclusivity) and in host-side tests
//! (where real threads contend on the atomic).

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Services the integrator must supply.
///
/// * `critical_enter`/`critical_exit` bracket every access to shared
///   stack state.  On a bare-metal target these disable and restore
///   interrupts; under an RTOS they map to the scheduler's critical
///   section.  Reentrancy is permitted on the platform side (a counting
///   implementation is fine) — the stack itself acquires at most once
///   per public operation and never transmits while holding the lock,
///   so a loopback platform may feed transmitted frames straight back
///   into [`Stack::process_rx`](crate::stack::Stack::process_rx).
/// * `time_ms` is a monotonic millisecond clock that wraps at 2³².
///   All age comparisons inside the stack use wrapping subtraction.
/// * `transmit` hands a complete Ethernet frame to hardware.  It is
///   fire-and-forget: enqueue and return promptly, never block.
pub trait Platform {
    /// Enter a critical section.  Returns an opaque token (saved
    /// interrupt state) passed back to [`critical_exit`](Self::critical_exit).
    fn critical_enter() -> u32;

    /// Leave a critical section, restoring the state captured by the
    /// matching [`critical_enter`](Self::critical_enter).
    fn critical_exit(token: u32);

    /// Monotonic millisecond clock, wrapping at `u32::MAX`.
    fn time_ms() -> u32;

    /// Hand a frame to the hardware transmit path.
    fn transmit(frame: &[u8]);
}

// =============================================================================
// CritMutex
// =============================================================================

/// Mutex that holds the platform critical section while locked.
///
/// The guard restores the critical-section state on every exit path via
/// `Drop`, so an early `return` or `?` cannot leak a disabled-interrupt
/// state.
pub struct CritMutex<P: Platform, T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
    _platform: PhantomData<fn() -> P>,
}

// SAFETY: CritMutex provides exclusive access through the atomic flag
// with the platform critical section held, making it safe to share
// between thread context and interrupt context.
unsafe impl<P: Platform, T: Send> Send for CritMutex<P, T> {}
unsafe impl<P: Platform, T: Send> Sync for CritMutex<P, T> {}

/// RAII guard for [`CritMutex`].  Dereferences to the protected data.
pub struct CritMutexGuard<'a, P: Platform, T> {
    mutex: &'a CritMutex<P, T>,
    token: u32,
}

impl<P: Platform, T> CritMutex<P, T> {
    /// Create a new mutex protecting `data`.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            _platform: PhantomData,
        }
    }

    /// Acquire the lock, entering the platform critical section first.
    #[inline]
    pub fn lock(&self) -> CritMutexGuard<'_, P, T> {
        let token = P::critical_enter();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }

        CritMutexGuard { mutex: self, token }
    }
}

impl<'a, P: Platform, T> Deref for CritMutexGuard<'a, P, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock — exclusive access.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, P: Platform, T> DerefMut for CritMutexGuard<'a, P, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock — exclusive access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, P: Platform, T> Drop for CritMutexGuard<'a, P, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.store(false, Ordering::Release);
        P::critical_exit(self.token);
    }
}
