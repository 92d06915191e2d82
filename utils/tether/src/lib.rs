//! Host-side substrate for exchanging values with a WebAssembly guest through opaque handles.

pub mod codec;
pub mod sandbox;

mod closure;
pub use self::closure::*;

mod context;
pub use self::context::*;

mod exn;
pub use self::exn::*;

mod handle;
pub use self::handle::*;

mod memory;
pub use self::memory::*;
