use anyhow::Context as _;

use crate::{
    context::GuestContext,
    handle::Handle,
};

// === ExnSlot === //

/// A guest-supplied pair of `u32` words through which fallible imports report failure.
///
/// Word 0 is the failure flag and word 1 the handle of the thrown value. On success the slot is
/// left untouched so the guest only has to zero it once before a batch of calls.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct ExnSlot(u32);

impl ExnSlot {
    pub const FAILED: u32 = 1;

    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> u32 {
        self.0
    }

    fn handle_addr(self) -> anyhow::Result<u32> {
        self.0
            .checked_add(4)
            .with_context(|| format!("exception slot at {:#x} overflows guest memory", self.0))
    }

    /// Stores `error` in the handle table and flags the slot as failed.
    pub fn raise<C>(self, cx: &mut C, error: C::Value) -> anyhow::Result<Handle>
    where
        C: ?Sized + GuestContext,
    {
        let handle_addr = self.handle_addr()?;

        // Both words must be addressable before the error takes a slot in the handle table.
        cx.read_word(self.0)?;
        cx.read_word(handle_addr)?;

        let handle = cx.alloc_handle(error);
        cx.write_word(self.0, Self::FAILED)?;
        cx.write_word(handle_addr, handle.raw())?;

        Ok(handle)
    }

    /// Reads the slot back, yielding the error handle if the slot has been flagged.
    pub fn check<C>(self, cx: &mut C) -> anyhow::Result<Option<Handle>>
    where
        C: ?Sized + GuestContext,
    {
        if cx.read_word(self.0)? != Self::FAILED {
            return Ok(None);
        }

        Ok(Some(Handle::from_raw(cx.read_word(self.handle_addr()?)?)))
    }
}

// === Transport === //

/// The value returned to the guest in place of a real result when a call fails. The guest must
/// ignore it after seeing the failure flag.
pub trait Placeholder {
    fn placeholder() -> Self;
}

impl Placeholder for () {
    fn placeholder() -> Self {}
}

impl Placeholder for u32 {
    fn placeholder() -> Self {
        0
    }
}

impl Placeholder for f64 {
    fn placeholder() -> Self {
        0.0
    }
}

/// Maps the outcome of a host capability onto the exception slot protocol.
pub fn transport<C, T>(
    cx: &mut C,
    slot: ExnSlot,
    outcome: Result<T, C::Value>,
) -> anyhow::Result<T>
where
    C: ?Sized + GuestContext,
    T: Placeholder,
{
    match outcome {
        Ok(value) => Ok(value),
        Err(error) => {
            let handle = slot.raise(cx, error)?;
            tracing::debug!(slot = slot.addr(), ?handle, "host capability threw");
            Ok(T::placeholder())
        }
    }
}
