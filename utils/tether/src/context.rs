use anyhow::Context as _;

use crate::{
    codec,
    handle::{Handle, HandleTable, HandleValue},
    memory::MemoryViews,
};

// === Bridge === //

/// Per-instance bridging state: the handle table plus the memory view caches.
#[derive(Debug)]
pub struct Bridge<V> {
    pub handles: HandleTable<V>,
    pub views: MemoryViews,
    global_argument_ptr: Option<u32>,
}

impl<V: HandleValue> Default for Bridge<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: HandleValue> Bridge<V> {
    pub fn new() -> Self {
        Self {
            handles: HandleTable::new(),
            views: MemoryViews::default(),
            global_argument_ptr: None,
        }
    }
}

pub struct GuestParts<'a, V, H> {
    pub memory: &'a mut [u8],
    pub bridge: &'a mut Bridge<V>,
    pub host: &'a mut H,
}

// === GuestContext === //

/// Access to a running guest from within a host call.
///
/// Implementors hand out the guest's current linear memory alongside the bridge state and
/// whatever host state the embedder attaches. Every call to [`GuestContext::parts`] must reflect
/// the buffer as it is *now*; nothing derived from it may be held across `alloc` or
/// `call_indirect` since those can grow memory.
pub trait GuestContext {
    type Value: HandleValue;
    type Host;

    fn parts(&mut self) -> GuestParts<'_, Self::Value, Self::Host>;

    /// Calls the guest's exported allocator.
    fn alloc(&mut self, size: u32) -> anyhow::Result<u32>;

    /// Calls the function at `index` in the guest's indirect function table.
    fn call_indirect(&mut self, index: u32, args: &[u32]) -> anyhow::Result<u32>;

    /// Calls the guest export returning the base of its global argument area.
    fn load_global_argument_ptr(&mut self) -> anyhow::Result<u32>;

    // === Provided === //

    fn bridge(&mut self) -> &mut Bridge<Self::Value> {
        self.parts().bridge
    }

    fn host(&mut self) -> &mut Self::Host {
        self.parts().host
    }

    fn handles(&mut self) -> &mut HandleTable<Self::Value> {
        &mut self.bridge().handles
    }

    fn alloc_handle(&mut self, value: Self::Value) -> Handle {
        self.handles().alloc(value)
    }

    fn resolve(&mut self, handle: Handle) -> anyhow::Result<Self::Value> {
        Ok(self.handles().resolve(handle).inspect_err(|err| {
            tracing::error!("guest passed an invalid handle: {err}");
        })?)
    }

    fn take(&mut self, handle: Handle) -> anyhow::Result<Self::Value> {
        Ok(self.handles().take(handle).inspect_err(|err| {
            tracing::error!("guest passed an invalid handle: {err}");
        })?)
    }

    fn read_str(&mut self, ptr: u32, len: u32) -> anyhow::Result<String> {
        codec::decode(self, ptr, len)
    }

    fn write_str(&mut self, text: &str) -> anyhow::Result<(u32, u32)> {
        codec::encode(self, text)
    }

    fn read_word(&mut self, addr: u32) -> anyhow::Result<u32> {
        let index = word_index(addr)?;
        let GuestParts { memory, bridge, .. } = self.parts();

        Ok(bridge.views.words.view(memory).get(index)?)
    }

    fn write_word(&mut self, addr: u32, value: u32) -> anyhow::Result<()> {
        let index = word_index(addr)?;
        let GuestParts { memory, bridge, .. } = self.parts();

        bridge.views.words.view_mut(memory).set(index, value)?;
        Ok(())
    }

    fn write_byte(&mut self, addr: u32, value: u8) -> anyhow::Result<()> {
        let GuestParts { memory, bridge, .. } = self.parts();

        bridge.views.bytes.view_mut(memory).set(addr, value)?;
        Ok(())
    }

    /// Reads the `n`th word of the guest's global argument area. The base pointer is requested
    /// from the guest once and cached for the lifetime of the bridge.
    fn global_argument(&mut self, n: u32) -> anyhow::Result<u32> {
        let base = match self.bridge().global_argument_ptr {
            Some(base) => base,
            None => {
                let base = self.load_global_argument_ptr()?;
                self.bridge().global_argument_ptr = Some(base);
                base
            }
        };

        let addr = n
            .checked_mul(4)
            .and_then(|offset| base.checked_add(offset))
            .context("global argument address overflows guest memory")?;

        self.read_word(addr)
    }
}

fn word_index(addr: u32) -> anyhow::Result<u32> {
    if addr % 4 != 0 {
        anyhow::bail!("guest word address {addr:#x} is not 4-byte aligned");
    }

    Ok(addr / 4)
}
