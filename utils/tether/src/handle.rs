use std::fmt;

use thiserror::Error;

// === Handle === //

/// Number of persistent slots pinned to the `undefined`, `null`, `true` and `false` sentinels.
pub const RESERVED_SLOTS: u32 = 4;

/// An opaque reference to a host value, as seen by the guest.
///
/// The low bit selects the handle space: odd handles index the call-local transient stack while
/// even handles index the persistent slab. The remaining bits are the index into that space.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    pub const UNDEFINED: Self = Self::persistent(0);
    pub const NULL: Self = Self::persistent(1);
    pub const TRUE: Self = Self::persistent(2);
    pub const FALSE: Self = Self::persistent(3);

    pub const MAX_INDEX: u32 = u32::MAX >> 1;

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn persistent(index: u32) -> Self {
        Self(index << 1)
    }

    pub const fn transient(index: u32) -> Self {
        Self((index << 1) | 1)
    }

    pub const fn from_bool(value: bool) -> Self {
        if value { Self::TRUE } else { Self::FALSE }
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> u32 {
        self.0 >> 1
    }

    pub const fn is_transient(self) -> bool {
        self.0 & 1 == 1
    }

    pub const fn is_reserved(self) -> bool {
        !self.is_transient() && self.index() < RESERVED_SLOTS
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let space = if self.is_transient() {
            "transient"
        } else {
            "persistent"
        };

        write!(f, "Handle({space} #{})", self.index())
    }
}

/// Values that can live in a [`HandleTable`]. The table needs to materialize the four sentinel
/// values when it is created.
pub trait HandleValue: Clone + 'static {
    fn undefined() -> Self;

    fn null() -> Self;

    fn boolean(value: bool) -> Self;
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum InvalidHandle {
    #[error("{0:?} is past the end of the handle table")]
    OutOfRange(Handle),

    #[error("{0:?} refers to a slot which has already been freed")]
    Freed(Handle),

    #[error("{0:?} does not refer to a live entry on the transient stack")]
    StaleTransient(Handle),
}

// === HandleTable === //

#[derive(Debug, Clone)]
enum Slot<V> {
    Reserved(V),
    Live { value: V, refcount: u32 },
    Free { next: u32 },
}

/// A reference-counted slab of host values addressed by [`Handle`]s.
///
/// Free slots are threaded into a singly linked list through the slab itself so that freed
/// indices are reused in LIFO order before the slab grows. Every mutation happens within a single
/// `&mut self` call, so callers re-entering guest code can never observe a half-linked slot.
#[derive(Debug, Clone)]
pub struct HandleTable<V> {
    slots: Vec<Slot<V>>,
    next_free: u32,
    stack: Vec<V>,
    live: usize,
}

impl<V: HandleValue> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: HandleValue> HandleTable<V> {
    pub fn new() -> Self {
        Self {
            slots: vec![
                Slot::Reserved(V::undefined()),
                Slot::Reserved(V::null()),
                Slot::Reserved(V::boolean(true)),
                Slot::Reserved(V::boolean(false)),
            ],
            next_free: RESERVED_SLOTS,
            stack: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, value: V) -> Handle {
        let index = self.next_free;

        if index as usize == self.slots.len() {
            assert!(index <= Handle::MAX_INDEX, "handle table exhausted");
            self.slots.push(Slot::Free { next: index + 1 });
        }

        let next = match &self.slots[index as usize] {
            Slot::Free { next } => *next,
            _ => unreachable!("free list head {index} points at an occupied slot"),
        };

        self.next_free = next;
        self.slots[index as usize] = Slot::Live { value, refcount: 1 };
        self.live += 1;

        tracing::trace!(index, "allocated host handle");

        Handle::persistent(index)
    }

    pub fn resolve(&self, handle: Handle) -> Result<V, InvalidHandle> {
        self.get(handle).cloned()
    }

    pub fn get(&self, handle: Handle) -> Result<&V, InvalidHandle> {
        if handle.is_transient() {
            return self
                .stack
                .get(handle.index() as usize)
                .ok_or(InvalidHandle::StaleTransient(handle));
        }

        match self.slots.get(handle.index() as usize) {
            Some(Slot::Reserved(value) | Slot::Live { value, .. }) => Ok(value),
            Some(Slot::Free { .. }) => Err(InvalidHandle::Freed(handle)),
            None => Err(InvalidHandle::OutOfRange(handle)),
        }
    }

    pub fn retain(&mut self, handle: Handle) -> Result<Handle, InvalidHandle> {
        // Transient entries die with their call frame so cloning one promotes it into the slab.
        if handle.is_transient() {
            let value = self.resolve(handle)?;
            return Ok(self.alloc(value));
        }

        match self.slots.get_mut(handle.index() as usize) {
            Some(Slot::Reserved(_)) => Ok(handle),
            Some(Slot::Live { refcount, .. }) => {
                *refcount += 1;
                Ok(handle)
            }
            Some(Slot::Free { .. }) => Err(InvalidHandle::Freed(handle)),
            None => Err(InvalidHandle::OutOfRange(handle)),
        }
    }

    pub fn release(&mut self, handle: Handle) -> Result<(), InvalidHandle> {
        if handle.is_transient() {
            return Ok(());
        }

        let index = handle.index();
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(InvalidHandle::OutOfRange(handle))?;

        let refcount = match &mut *slot {
            Slot::Reserved(_) => return Ok(()),
            Slot::Live { refcount, .. } => refcount,
            Slot::Free { .. } => return Err(InvalidHandle::Freed(handle)),
        };

        *refcount -= 1;

        if *refcount > 0 {
            return Ok(());
        }

        *slot = Slot::Free {
            next: self.next_free,
        };
        self.next_free = index;
        self.live -= 1;

        tracing::trace!(index, "freed host handle");

        Ok(())
    }

    pub fn take(&mut self, handle: Handle) -> Result<V, InvalidHandle> {
        let value = self.resolve(handle)?;
        self.release(handle)?;
        Ok(value)
    }

    pub fn refcount(&self, handle: Handle) -> Option<u32> {
        if handle.is_transient() {
            return None;
        }

        match self.slots.get(handle.index() as usize)? {
            Slot::Live { refcount, .. } => Some(*refcount),
            _ => None,
        }
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of non-sentinel slots currently holding a value.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots in the slab, free or otherwise.
    pub fn slab_len(&self) -> usize {
        self.slots.len()
    }

    // Transient stack

    pub fn push_transient(&mut self, value: V) -> Handle {
        let index = u32::try_from(self.stack.len())
            .ok()
            .filter(|&index| index <= Handle::MAX_INDEX)
            .unwrap_or_else(|| panic!("transient stack exhausted"));

        self.stack.push(value);
        Handle::transient(index)
    }

    pub fn transient_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn truncate_transients(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    /// Runs `f` and then pops every transient entry it pushed, even if `f` unwinds.
    pub fn with_transients<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let depth = self.stack.len();
        let mut me = scopeguard::guard(self, |me| me.truncate_transients(depth));

        f(&mut **me)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Val {
        Undefined,
        Null,
        Bool(bool),
        Int(i32),
    }

    impl HandleValue for Val {
        fn undefined() -> Self {
            Val::Undefined
        }

        fn null() -> Self {
            Val::Null
        }

        fn boolean(value: bool) -> Self {
            Val::Bool(value)
        }
    }

    #[test]
    fn sentinels_resolve_to_their_values() {
        let table = HandleTable::<Val>::new();

        assert_eq!(table.resolve(Handle::UNDEFINED), Ok(Val::Undefined));
        assert_eq!(table.resolve(Handle::NULL), Ok(Val::Null));
        assert_eq!(table.resolve(Handle::TRUE), Ok(Val::Bool(true)));
        assert_eq!(table.resolve(Handle::FALSE), Ok(Val::Bool(false)));
        assert_eq!(Handle::NULL.raw(), 2);
        assert_eq!(Handle::FALSE.raw(), 6);
    }

    #[test]
    fn first_allocation_follows_sentinels() {
        let mut table = HandleTable::new();
        let handle = table.alloc(Val::Int(7));

        assert_eq!(handle.raw(), 8);
        assert!(!handle.is_transient());
        assert_eq!(table.resolve(handle), Ok(Val::Int(7)));
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn slot_freed_after_retains_plus_one_releases() {
        let mut table = HandleTable::new();
        let handle = table.alloc(Val::Int(1));

        for _ in 0..3 {
            assert_eq!(table.retain(handle), Ok(handle));
        }
        assert_eq!(table.refcount(handle), Some(4));

        for _ in 0..3 {
            table.release(handle).unwrap();
            assert!(table.is_live(handle));
        }

        table.release(handle).unwrap();
        assert_eq!(table.resolve(handle), Err(InvalidHandle::Freed(handle)));
        assert_eq!(table.release(handle), Err(InvalidHandle::Freed(handle)));
        assert_eq!(table.retain(handle), Err(InvalidHandle::Freed(handle)));
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn freed_slots_are_reused_lifo_before_growth() {
        let mut table = HandleTable::new();
        let a = table.alloc(Val::Int(1));
        let b = table.alloc(Val::Int(2));
        let c = table.alloc(Val::Int(3));
        let len = table.slab_len();

        table.release(b).unwrap();
        assert_eq!(table.alloc(Val::Int(4)), b);

        table.release(a).unwrap();
        table.release(c).unwrap();
        assert_eq!(table.alloc(Val::Int(5)), c);
        assert_eq!(table.alloc(Val::Int(6)), a);
        assert_eq!(table.slab_len(), len);

        let d = table.alloc(Val::Int(7));
        assert_eq!(d.index() as usize, len);
    }

    #[test]
    fn sentinels_are_never_freed_or_reused() {
        let mut table = HandleTable::<Val>::new();

        for sentinel in [Handle::UNDEFINED, Handle::NULL, Handle::TRUE, Handle::FALSE] {
            for _ in 0..5 {
                assert_eq!(table.retain(sentinel), Ok(sentinel));
                table.release(sentinel).unwrap();
                table.release(sentinel).unwrap();
            }
            assert!(table.is_live(sentinel));
        }

        let handle = table.alloc(Val::Int(0));
        assert_eq!(handle.index(), RESERVED_SLOTS);
        assert_eq!(table.resolve(Handle::TRUE), Ok(Val::Bool(true)));
    }

    #[test]
    fn out_of_range_handles_are_rejected() {
        let mut table = HandleTable::<Val>::new();
        let bogus = Handle::persistent(99);

        assert_eq!(table.resolve(bogus), Err(InvalidHandle::OutOfRange(bogus)));
        assert_eq!(table.release(bogus), Err(InvalidHandle::OutOfRange(bogus)));
        assert_eq!(
            table.resolve(Handle::transient(0)),
            Err(InvalidHandle::StaleTransient(Handle::transient(0)))
        );
    }

    #[test]
    fn retaining_transient_promotes_it() {
        let mut table = HandleTable::new();
        let depth = table.transient_depth();
        let transient = table.push_transient(Val::Int(42));

        assert!(transient.is_transient());
        assert_eq!(table.resolve(transient), Ok(Val::Int(42)));

        let promoted = table.retain(transient).unwrap();
        assert!(!promoted.is_transient());

        // Releasing a transient handle is a no-op.
        table.release(transient).unwrap();
        table.truncate_transients(depth);

        assert!(!table.is_live(transient));
        assert_eq!(table.take(promoted), Ok(Val::Int(42)));
        assert!(!table.is_live(promoted));
    }

    #[test]
    fn transient_scope_pops_its_entries() {
        let mut table = HandleTable::new();
        let outer = table.push_transient(Val::Int(1));

        let inner = table.with_transients(|table| {
            let inner = table.push_transient(Val::Int(2));
            assert_eq!(table.resolve(inner), Ok(Val::Int(2)));
            inner
        });

        assert_eq!(table.transient_depth(), 1);
        assert!(!table.is_live(inner));
        assert_eq!(table.resolve(outer), Ok(Val::Int(1)));
    }
}
