use std::{marker::PhantomData, mem, ops::Range};

use bytemuck::Pod;
use derive_where::derive_where;
use thiserror::Error;

// === BufferId === //

/// Identity of the guest's linear-memory buffer.
///
/// Growing guest memory may move the buffer and always changes its length, so the pair of base
/// address and length changes whenever previously derived views must be thrown away.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct BufferId {
    base: usize,
    len: usize,
}

impl BufferId {
    pub fn of(buffer: &[u8]) -> Self {
        Self {
            base: buffer.as_ptr() as usize,
            len: buffer.len(),
        }
    }

    pub fn len(self) -> usize {
        self.len
    }

    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("guest memory access {start:#x}..{end:#x} is out of bounds for a {len} byte buffer")]
pub struct MemoryFault {
    pub start: u64,
    pub end: u64,
    pub len: usize,
}

// === ViewCache === //

#[derive(Debug, Copy, Clone)]
struct CachedView {
    buffer: BufferId,
    elems: usize,
}

/// Lazily derived typed view over guest memory for a single element width.
#[derive_where(Debug, Default)]
pub struct ViewCache<T> {
    _ty: PhantomData<fn() -> T>,
    cached: Option<CachedView>,
    derivations: u64,
}

impl<T: Pod> ViewCache<T> {
    fn validate(&mut self, buffer: BufferId) -> usize {
        match self.cached {
            Some(view) if view.buffer == buffer => view.elems,
            _ => {
                let elems = buffer.len() / mem::size_of::<T>();

                self.cached = Some(CachedView { buffer, elems });
                self.derivations += 1;

                tracing::trace!(
                    width = mem::size_of::<T>(),
                    bytes = buffer.len(),
                    "derived guest memory view"
                );

                elems
            }
        }
    }

    pub fn view<'m>(&mut self, memory: &'m [u8]) -> MemoryView<'m, T> {
        let elems = self.validate(BufferId::of(memory));

        MemoryView {
            _ty: PhantomData,
            bytes: &memory[..elems * mem::size_of::<T>()],
        }
    }

    pub fn view_mut<'m>(&mut self, memory: &'m mut [u8]) -> MemoryViewMut<'m, T> {
        let elems = self.validate(BufferId::of(memory));

        MemoryViewMut {
            _ty: PhantomData,
            bytes: &mut memory[..elems * mem::size_of::<T>()],
        }
    }

    pub fn is_current(&self, memory: &[u8]) -> bool {
        self.cached
            .is_some_and(|view| view.buffer == BufferId::of(memory))
    }

    /// Number of times the view has been (re-)derived from a fresh buffer.
    pub fn derivations(&self) -> u64 {
        self.derivations
    }
}

/// The per-width view caches used by the bridge.
#[derive(Debug, Default)]
pub struct MemoryViews {
    pub bytes: ViewCache<u8>,
    pub words: ViewCache<u32>,
}

// === MemoryView === //

fn elem_range<T>(index: u32, count: u32, len: usize) -> Result<Range<usize>, MemoryFault> {
    let width = mem::size_of::<T>() as u64;
    let start = u64::from(index) * width;
    let end = start + u64::from(count) * width;

    if end > len as u64 {
        return Err(MemoryFault { start, end, len });
    }

    Ok(start as usize..end as usize)
}

pub struct MemoryView<'m, T> {
    _ty: PhantomData<fn() -> T>,
    bytes: &'m [u8],
}

impl<'m, T: Pod> MemoryView<'m, T> {
    pub fn len(&self) -> usize {
        self.bytes.len() / mem::size_of::<T>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> Result<T, MemoryFault> {
        let range = elem_range::<T>(index, 1, self.bytes.len())?;
        Ok(bytemuck::pod_read_unaligned(&self.bytes[range]))
    }
}

impl<'m> MemoryView<'m, u8> {
    pub fn subarray(&self, start: u32, len: u32) -> Result<&'m [u8], MemoryFault> {
        let range = elem_range::<u8>(start, len, self.bytes.len())?;
        Ok(&self.bytes[range])
    }
}

pub struct MemoryViewMut<'m, T> {
    _ty: PhantomData<fn() -> T>,
    bytes: &'m mut [u8],
}

impl<'m, T: Pod> MemoryViewMut<'m, T> {
    pub fn len(&self) -> usize {
        self.bytes.len() / mem::size_of::<T>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32) -> Result<T, MemoryFault> {
        let range = elem_range::<T>(index, 1, self.bytes.len())?;
        Ok(bytemuck::pod_read_unaligned(&self.bytes[range]))
    }

    pub fn set(&mut self, index: u32, value: T) -> Result<(), MemoryFault> {
        let range = elem_range::<T>(index, 1, self.bytes.len())?;
        self.bytes[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }
}

impl<'m> MemoryViewMut<'m, u8> {
    pub fn subarray_mut(self, start: u32, len: u32) -> Result<&'m mut [u8], MemoryFault> {
        let range = elem_range::<u8>(start, len, self.bytes.len())?;
        Ok(&mut self.bytes[range])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_is_reused_while_buffer_is_unchanged() {
        let memory = vec![0u8; 64];
        let mut cache = ViewCache::<u32>::default();

        assert_eq!(cache.view(&memory).len(), 16);
        assert_eq!(cache.view(&memory).len(), 16);
        assert_eq!(cache.derivations(), 1);
        assert!(cache.is_current(&memory));
    }

    #[test]
    fn view_is_rederived_after_reallocation() {
        let mut memory = vec![0u8; 64];
        let mut cache = ViewCache::<u8>::default();

        assert_eq!(cache.view(&memory).len(), 64);

        let mut grown = vec![0u8; 128];
        grown[..64].copy_from_slice(&memory);
        grown[100] = 9;
        memory = grown;

        assert!(!cache.is_current(&memory));
        let view = cache.view(&memory);
        assert_eq!(view.len(), 128);
        assert_eq!(view.get(100), Ok(9));
        assert_eq!(cache.derivations(), 2);
    }

    #[test]
    fn widths_are_cached_independently() {
        let mut memory = vec![0u8; 32];
        let mut views = MemoryViews::default();

        views.words.view_mut(&mut memory).set(2, 0xdead_beef).unwrap();
        assert_eq!(views.bytes.derivations(), 0);
        assert_eq!(views.words.derivations(), 1);

        let bytes = views.bytes.view(&memory);
        assert_eq!(bytes.subarray(8, 4).unwrap(), &0xdead_beef_u32.to_ne_bytes());
    }

    #[test]
    fn out_of_bounds_access_faults() {
        let memory = vec![0u8; 10];
        let mut views = MemoryViews::default();

        // The word view only covers whole words.
        assert_eq!(views.words.view(&memory).len(), 2);
        assert!(views.words.view(&memory).get(2).is_err());
        assert_eq!(
            views.bytes.view(&memory).subarray(8, 4),
            Err(MemoryFault {
                start: 8,
                end: 12,
                len: 10
            })
        );
    }
}
