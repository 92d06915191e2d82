//! An in-process stand-in for a guest instance.
//!
//! The sandbox owns a growable byte buffer as its linear memory, a bump allocator over it, and a
//! function table populated with Rust closures. It lets the bridge and the host shims be driven
//! without compiling a guest module.

use std::{fmt, rc::Rc};

use crate::{
    context::{Bridge, GuestContext, GuestParts},
    handle::HandleValue,
};

pub const PAGE_SIZE: usize = 65536;

const HEAP_BASE: u32 = 8;
const HEAP_ALIGN: u32 = 8;
const GLOBAL_ARGUMENT_WORDS: u32 = 16;

type SandboxFn<V, H> = Rc<dyn Fn(&mut Sandbox<V, H>, &[u32]) -> anyhow::Result<u32>>;

pub struct Sandbox<V, H> {
    memory: Vec<u8>,
    heap_top: u32,
    growths: u32,
    table: Vec<Option<SandboxFn<V, H>>>,
    global_argument_ptr: Option<u32>,
    bridge: Bridge<V>,
    host: H,
}

impl<V, H> fmt::Debug for Sandbox<V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("memory_len", &self.memory.len())
            .field("heap_top", &self.heap_top)
            .field("growths", &self.growths)
            .field("functions", &self.table.len())
            .finish_non_exhaustive()
    }
}

impl<V: HandleValue, H: 'static> Sandbox<V, H> {
    pub fn new(host: H) -> Self {
        Self {
            memory: vec![0; PAGE_SIZE],
            heap_top: HEAP_BASE,
            growths: 0,
            // Slot 0 is the null function.
            table: vec![None],
            global_argument_ptr: None,
            bridge: Bridge::new(),
            host,
        }
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Grows memory by `pages`, always moving it into a fresh buffer.
    pub fn grow(&mut self, pages: usize) {
        let mut grown = vec![0; self.memory.len() + pages * PAGE_SIZE];
        grown[..self.memory.len()].copy_from_slice(&self.memory);
        self.memory = grown;
        self.growths += 1;
    }

    /// Number of times memory has grown.
    pub fn growths(&self) -> u32 {
        self.growths
    }

    /// Adds `f` to the function table and returns its index.
    pub fn define(
        &mut self,
        f: impl 'static + Fn(&mut Sandbox<V, H>, &[u32]) -> anyhow::Result<u32>,
    ) -> u32 {
        self.table.push(Some(Rc::new(f)));
        (self.table.len() - 1) as u32
    }

    /// Overwrites the global argument area with `words`.
    pub fn set_global_arguments(&mut self, words: &[u32]) -> anyhow::Result<()> {
        if words.len() > GLOBAL_ARGUMENT_WORDS as usize {
            anyhow::bail!("at most {GLOBAL_ARGUMENT_WORDS} global arguments are supported");
        }

        let base = match self.global_argument_ptr {
            Some(base) => base,
            None => {
                let base = self.alloc(GLOBAL_ARGUMENT_WORDS * 4)?;
                self.global_argument_ptr = Some(base);
                base
            }
        };

        for (i, &word) in words.iter().enumerate() {
            self.write_word(base + i as u32 * 4, word)?;
        }

        Ok(())
    }
}

impl<V: HandleValue, H: 'static> GuestContext for Sandbox<V, H> {
    type Value = V;
    type Host = H;

    fn parts(&mut self) -> GuestParts<'_, V, H> {
        GuestParts {
            memory: &mut self.memory,
            bridge: &mut self.bridge,
            host: &mut self.host,
        }
    }

    fn alloc(&mut self, size: u32) -> anyhow::Result<u32> {
        let ptr = self.heap_top.next_multiple_of(HEAP_ALIGN);
        let end = ptr
            .checked_add(size)
            .ok_or_else(|| anyhow::anyhow!("sandbox heap exhausted"))?;

        if end as usize > self.memory.len() {
            let missing = end as usize - self.memory.len();
            self.grow(missing.div_ceil(PAGE_SIZE));
        }

        self.heap_top = end;
        Ok(ptr)
    }

    fn call_indirect(&mut self, index: u32, args: &[u32]) -> anyhow::Result<u32> {
        let Some(Some(f)) = self.table.get(index as usize) else {
            anyhow::bail!("sandbox function table has no entry at {index}");
        };

        let f = f.clone();
        f(self, args)
    }

    fn load_global_argument_ptr(&mut self) -> anyhow::Result<u32> {
        self.global_argument_ptr
            .ok_or_else(|| anyhow::anyhow!("sandbox has no global argument area"))
    }
}

// === SandboxValue === //

/// A minimal value type for exercising the bridge without a full host object model.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl HandleValue for SandboxValue {
    fn undefined() -> Self {
        Self::Undefined
    }

    fn null() -> Self {
        Self::Null
    }

    fn boolean(value: bool) -> Self {
        Self::Bool(value)
    }
}
