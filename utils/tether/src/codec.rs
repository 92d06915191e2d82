//! UTF-8 string transport between host strings and `(ptr, len)` ranges in guest memory.

use anyhow::Context as _;

use crate::context::{GuestContext, GuestParts};

/// Decodes `len` bytes at `ptr` as UTF-8, replacing malformed sequences with U+FFFD.
pub fn decode<C>(cx: &mut C, ptr: u32, len: u32) -> anyhow::Result<String>
where
    C: ?Sized + GuestContext,
{
    let GuestParts { memory, bridge, .. } = cx.parts();
    let bytes = bridge.views.bytes.view(memory).subarray(ptr, len)?;

    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Copies `text` into a fresh guest allocation and returns its `(ptr, len)`. The guest owns the
/// allocation from then on.
pub fn encode<C>(cx: &mut C, text: &str) -> anyhow::Result<(u32, u32)>
where
    C: ?Sized + GuestContext,
{
    let len = u32::try_from(text.len()).context("string is too large for guest memory")?;
    let ptr = cx.alloc(len)?;

    if ptr == 0 && len > 0 {
        anyhow::bail!("failed to allocate {len} byte(s) for a guest string");
    }

    // The allocation may have grown memory; `parts` hands us the buffer as it is now.
    let GuestParts { memory, bridge, .. } = cx.parts();
    bridge
        .views
        .bytes
        .view_mut(memory)
        .subarray_mut(ptr, len)?
        .copy_from_slice(text.as_bytes());

    Ok((ptr, len))
}

#[cfg(test)]
mod tests {
    use crate::{
        GuestContext,
        sandbox::{Sandbox, SandboxValue},
    };

    fn sandbox() -> Sandbox<SandboxValue, ()> {
        Sandbox::new(())
    }

    #[test]
    fn text_round_trips_through_guest_memory() {
        let mut sb = sandbox();

        for text in ["", "hello", "ünïcödé ✓", "emoji 🦀🦀", "nul\0byte", "line\nbreak"] {
            let (ptr, len) = sb.write_str(text).unwrap();
            assert_eq!(len as usize, text.len());
            assert_eq!(sb.read_str(ptr, len).unwrap(), text);
        }
    }

    #[test]
    fn malformed_bytes_are_replaced() {
        let mut sb = sandbox();
        let ptr = sb.alloc(4).unwrap();
        sb.memory_mut()[ptr as usize..][..4].copy_from_slice(&[b'o', b'k', 0xff, 0xfe]);

        assert_eq!(sb.read_str(ptr, 4).unwrap(), "ok\u{fffd}\u{fffd}");
    }

    #[test]
    fn out_of_bounds_decode_fails() {
        let mut sb = sandbox();
        let len = sb.memory().len() as u32;

        assert!(sb.read_str(len - 2, 4).is_err());
        assert!(sb.read_str(u32::MAX, 1).is_err());
    }

    #[test]
    fn decode_observes_memory_growth() {
        let mut sb = sandbox();
        let (ptr, len) = sb.write_str("before").unwrap();
        assert_eq!(sb.read_str(ptr, len).unwrap(), "before");
        let derived = sb.bridge().views.bytes.derivations();

        sb.grow(1);
        sb.memory_mut()[ptr as usize..][..6].copy_from_slice(b"after!");

        assert_eq!(sb.read_str(ptr, len).unwrap(), "after!");
        assert_eq!(sb.bridge().views.bytes.derivations(), derived + 1);
    }

    #[test]
    fn encode_survives_growth_inside_allocator() {
        let mut sb = sandbox();
        let big = "x".repeat(sb.memory().len() * 2);

        let (ptr, len) = sb.write_str(&big).unwrap();
        assert!(sb.growths() > 0);
        assert_eq!(sb.read_str(ptr, len).unwrap(), big);
    }
}
