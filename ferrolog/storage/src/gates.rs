//! Per-transaction serialization gates.
//!
//! Each transaction carries two gates: the log gate, serializing log
//! insertion and the compensated-action anchor/depth pair, and the
//! structural gate, protecting state, dependents, and store lists. The
//! required acquisition order is log gate first, then structural gate.
//! [`StructuralGate::acquire_after`] encodes that order in the type system:
//! the only way to take the structural gate while logging is to present the
//! log guard as a proof token. `acquire` exists for paths that never touch
//! the log gate; debug builds verify a thread holding such a guard does not
//! sneak into the log gate afterwards.

#[cfg(debug_assertions)]
use std::cell::Cell;
use std::cell::RefCell;

use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};

#[cfg(debug_assertions)]
thread_local! {
    static STRUCTURAL_ONLY_HELD: Cell<u32> = const { Cell::new(0) };
}

/// The per-transaction log-insertion gate. Exactly one thread may log on a
/// transaction's behalf at a time.
pub struct LogGate<T> {
    inner: Mutex<T>,
}

impl<T> LogGate<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn acquire(&self) -> LogGuard<'_, T> {
        #[cfg(debug_assertions)]
        STRUCTURAL_ONLY_HELD.with(|held| {
            debug_assert_eq!(
                held.get(),
                0,
                "log gate acquired while a structural-only guard is held"
            );
        });
        LogGuard(self.inner.lock())
    }
}

/// Scoped guard for the log gate; releases on every exit path.
pub struct LogGuard<'a, T>(MutexGuard<'a, T>);

impl<T> std::ops::Deref for LogGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for LogGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// The per-transaction structural gate. Reentrant for the owning thread, so
/// a dependent callback may re-enter transaction methods without deadlock.
pub struct StructuralGate<T> {
    inner: ReentrantMutex<RefCell<T>>,
}

impl<T> StructuralGate<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(value)),
        }
    }

    /// Ordered acquisition: the caller proves it already holds the log gate.
    pub fn acquire_after<'a, U>(&'a self, _log: &LogGuard<'a, U>) -> StructuralGuard<'a, T> {
        StructuralGuard {
            inner: self.inner.lock(),
            tracked: false,
        }
    }

    /// Acquisition for paths that never touch the log gate (dependent
    /// registration, state queries). Taking the log gate while this guard
    /// is held is an ordering violation.
    pub fn acquire(&self) -> StructuralGuard<'_, T> {
        #[cfg(debug_assertions)]
        STRUCTURAL_ONLY_HELD.with(|held| held.set(held.get() + 1));
        StructuralGuard {
            inner: self.inner.lock(),
            tracked: true,
        }
    }
}

/// Scoped guard for the structural gate.
pub struct StructuralGuard<'a, T> {
    inner: ReentrantMutexGuard<'a, RefCell<T>>,
    tracked: bool,
}

impl<T> StructuralGuard<'_, T> {
    /// Run `f` with mutable access to the protected state. The borrow ends
    /// when `f` returns, so callbacks invoked afterwards may re-enter.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }
}

impl<T> Drop for StructuralGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        if self.tracked {
            STRUCTURAL_ONLY_HELD.with(|held| held.set(held.get() - 1));
        }
        #[cfg(not(debug_assertions))]
        let _ = self.tracked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_gate_excludes() {
        let gate = LogGate::new(0u32);
        {
            let mut g = gate.acquire();
            *g += 1;
        }
        assert_eq!(*gate.acquire(), 1);
    }

    #[test]
    fn test_structural_gate_is_reentrant() {
        let gate = StructuralGate::new(Vec::<u32>::new());
        let outer = gate.acquire();
        outer.with(|v| v.push(1));
        {
            // Same thread may re-enter without deadlocking.
            let inner = gate.acquire();
            inner.with(|v| v.push(2));
        }
        assert_eq!(outer.with(|v| v.clone()), vec![1, 2]);
    }

    #[test]
    fn test_ordered_acquisition() {
        let log = LogGate::new(());
        let structural = StructuralGate::new(0u32);
        let lg = log.acquire();
        let sg = structural.acquire_after(&lg);
        sg.with(|v| *v = 7);
        drop(sg);
        drop(lg);
        assert_eq!(structural.acquire().with(|v| *v), 7);
    }
}
