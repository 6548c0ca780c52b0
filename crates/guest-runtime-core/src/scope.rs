//! Reference-counted allocation tracking ("memory scopes").
//!
//! The guest has no collector, so the host offers an arena with
//! escape-by-retain: every tracked allocation starts with a count of 1 and is
//! recorded in the innermost open scope. Popping a scope releases each
//! allocation recorded since the matching push; anything retained elsewhere
//! survives.
//!
//! [`MemoryScopes`] is pure bookkeeping. It returns the pointers whose count
//! reached zero and leaves the actual deallocation call to the caller, which
//! owns the guest store.

use std::collections::HashMap;

/// Per-instance allocation tracker.
#[derive(Debug, Default)]
pub struct MemoryScopes {
    stack: Vec<Vec<i32>>,
    refcounts: HashMap<i32, u32>,
}

impl MemoryScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `ptr` with a count of 1.
    ///
    /// The pointer is recorded in the innermost scope, if one is open.
    pub fn track(&mut self, ptr: i32) {
        if ptr == 0 {
            return;
        }

        self.refcounts.insert(ptr, 1);
        if let Some(scope) = self.stack.last_mut() {
            scope.push(ptr);
        }
    }

    /// Increment the count of a tracked pointer.
    ///
    /// Returns `false` for untracked pointers.
    pub fn retain(&mut self, ptr: i32) -> bool {
        match self.refcounts.get_mut(&ptr) {
            Some(count) => {
                *count += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement the count of `ptr`.
    ///
    /// Returns `true` when the count reached zero and the pointer must be
    /// handed to the guest deallocator. Untracked or already freed pointers
    /// are ignored. A freed pointer is dropped from the scope that recorded
    /// it, since the allocator may hand the same address out again.
    pub fn release(&mut self, ptr: i32) -> bool {
        if !self.decrement(ptr) {
            return false;
        }

        for scope in self.stack.iter_mut().rev() {
            if let Some(index) = scope.iter().rposition(|tracked| *tracked == ptr) {
                scope.remove(index);
                break;
            }
        }
        true
    }

    fn decrement(&mut self, ptr: i32) -> bool {
        let Some(count) = self.refcounts.get_mut(&ptr) else {
            return false;
        };

        *count = count.saturating_sub(1);
        if *count > 0 {
            return false;
        }

        self.refcounts.remove(&ptr);
        true
    }

    pub fn push_scope(&mut self) {
        self.stack.push(Vec::new());
    }

    /// Close the innermost scope.
    ///
    /// Releases every pointer recorded since the matching push, in
    /// registration order, and returns those whose count reached zero.
    /// Popping with no open scope does nothing.
    pub fn pop_scope(&mut self) -> Vec<i32> {
        let Some(scope) = self.stack.pop() else {
            return Vec::new();
        };

        scope
            .into_iter()
            .filter(|ptr| self.decrement(*ptr))
            .collect()
    }

    /// Current count of `ptr`, or 0 when untracked.
    pub fn refcount(&self, ptr: i32) -> u32 {
        self.refcounts.get(&ptr).copied().unwrap_or(0)
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Number of live tracked allocations.
    pub fn live(&self) -> usize {
        self.refcounts.len()
    }
}
