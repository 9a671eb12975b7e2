//! Interrupt-safe synchronization
//!
//! [`IrqSpinMutex`] disables interrupts while held, so state shared with
//! interrupt handlers can be mutated without a handler re-entering the
//! critical section on the same CPU. This is the only interrupt-mask
//! bracketing primitive in the kernel; the guard restores the previous
//! DAIF state on every exit path.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu::{disable_interrupts, restore_interrupts};

/// A spinlock that disables interrupts while held.
///
/// Without the mask, this deadlocks on a single hart:
/// 1. kernel code acquires the lock
/// 2. an interrupt fires on the same CPU
/// 3. the handler spins on the same lock forever
///
/// # Safety Invariants
///
/// - Release the lock (drop the guard) before anything that may block.
/// - Keep critical sections short; the hart takes no interrupts inside.
pub struct IrqSpinMutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: IrqSpinMutex provides synchronization for its data; the data is
// only reachable through a guard that holds the lock.
unsafe impl<T: Send> Sync for IrqSpinMutex<T> {}
unsafe impl<T: Send> Send for IrqSpinMutex<T> {}

impl<T> IrqSpinMutex<T> {
    /// Create a new mutex holding `value`.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, disabling interrupts first.
    ///
    /// Returns a guard that restores the interrupt state when dropped.
    #[must_use]
    pub fn lock(&self) -> IrqSpinMutexGuard<'_, T> {
        // Interrupts go off BEFORE the acquire attempt so a handler can
        // never preempt a holder on this CPU.
        let daif = disable_interrupts();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        IrqSpinMutexGuard {
            mutex: self,
            daif,
            _not_send: core::marker::PhantomData,
        }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Interrupts stay masked only if the lock was acquired.
    #[must_use]
    pub fn try_lock(&self) -> Option<IrqSpinMutexGuard<'_, T>> {
        let daif = disable_interrupts();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinMutexGuard {
                mutex: self,
                daif,
                _not_send: core::marker::PhantomData,
            })
        } else {
            restore_interrupts(daif);
            None
        }
    }

    /// Get a mutable reference to the data. Safe: `&mut self` proves
    /// exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for IrqSpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Guard providing access to the locked data.
///
/// `!Send`: moving the guard to another thread would restore interrupt
/// state on the wrong CPU.
pub struct IrqSpinMutexGuard<'a, T> {
    mutex: &'a IrqSpinMutex<T>,
    daif: u64,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl<T> Deref for IrqSpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so we have exclusive access
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for IrqSpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so we have exclusive access
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for IrqSpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release before restoring interrupts so all writes are visible
        // before a handler can observe the lock free.
        self.mutex.locked.store(false, Ordering::Release);
        core::sync::atomic::fence(Ordering::SeqCst);
        restore_interrupts(self.daif);
    }
}

unsafe impl<T: Sync> Sync for IrqSpinMutexGuard<'_, T> {}
