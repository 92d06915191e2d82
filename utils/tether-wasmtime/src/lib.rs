use std::fmt;

use anyhow::Context;
use tether::{Bridge, GuestContext, GuestParts, HandleValue};
use wasmtime::{AsContext as _, AsContextMut as _};

// === StoreState === //

/// Store data for a bridged instance: the bridge itself, the embedder's host state, and the
/// guest exports the bridge calls back into.
pub struct StoreState<V, H> {
    pub bridge: Bridge<V>,
    pub host: H,
    exports: Option<BridgeExports>,
}

impl<V, H: fmt::Debug> fmt::Debug for StoreState<V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreState")
            .field("host", &self.host)
            .field("exports_ready", &self.exports.is_some())
            .finish_non_exhaustive()
    }
}

impl<V: HandleValue, H> StoreState<V, H> {
    pub fn new(host: H) -> Self {
        Self {
            bridge: Bridge::new(),
            host,
            exports: None,
        }
    }
}

/// Names of the guest exports the bridge relies on.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExportNames {
    pub memory: String,
    pub alloc: String,
    pub table: String,
    pub global_argument_ptr: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        Self {
            memory: "memory".to_string(),
            alloc: "__wbindgen_malloc".to_string(),
            table: "__indirect_function_table".to_string(),
            global_argument_ptr: "__wbindgen_global_argument_ptr".to_string(),
        }
    }
}

struct BridgeExports {
    memory: wasmtime::Memory,
    alloc: wasmtime::TypedFunc<u32, u32>,
    table: Option<wasmtime::Table>,
    global_argument_ptr: Option<wasmtime::TypedFunc<(), u32>>,
}

pub trait BridgeStoreExt<V, H> {
    fn setup_exports(
        &mut self,
        instance: wasmtime::Instance,
        names: &ExportNames,
    ) -> anyhow::Result<()>;

    /// Enters the bridge from outside of any guest call. Transient handles pushed during `f` are
    /// popped when it returns.
    fn root<R>(&mut self, f: impl FnOnce(&mut WasmContext<'_, V, H>) -> R) -> R;
}

impl<V: HandleValue, H: 'static> BridgeStoreExt<V, H> for wasmtime::Store<StoreState<V, H>> {
    fn setup_exports(
        &mut self,
        instance: wasmtime::Instance,
        names: &ExportNames,
    ) -> anyhow::Result<()> {
        let memory = instance
            .get_memory(&mut *self, &names.memory)
            .with_context(|| format!("failed to find guest memory export `{}`", names.memory))?;

        let alloc = instance
            .get_typed_func(&mut *self, &names.alloc)
            .with_context(|| format!("failed to find guest allocator `{}`", names.alloc))?;

        let table = instance.get_table(&mut *self, &names.table);
        if table.is_none() {
            tracing::debug!(name = names.table, "guest exports no function table");
        }

        let global_argument_ptr = match instance.get_export(&mut *self, &names.global_argument_ptr)
        {
            Some(_) => Some(
                instance
                    .get_typed_func(&mut *self, &names.global_argument_ptr)
                    .with_context(|| {
                        format!("`{}` has the wrong signature", names.global_argument_ptr)
                    })?,
            ),
            None => None,
        };

        self.data_mut().exports = Some(BridgeExports {
            memory,
            alloc,
            table,
            global_argument_ptr,
        });

        Ok(())
    }

    fn root<R>(&mut self, f: impl FnOnce(&mut WasmContext<'_, V, H>) -> R) -> R {
        let depth = self.data().bridge.handles.transient_depth();

        let mut me = scopeguard::guard(self, |me| {
            me.data_mut().bridge.handles.truncate_transients(depth);
        });

        f(&mut WasmContext(WasmContextInner::Root(&mut **me)))
    }
}

// === WasmContext === //

/// A [`GuestContext`] over a wasmtime store, either entered from the host or from within an
/// import called by the guest.
pub struct WasmContext<'a, V: 'static, H: 'static>(WasmContextInner<'a, V, H>);

enum WasmContextInner<'a, V: 'static, H: 'static> {
    Root(&'a mut wasmtime::Store<StoreState<V, H>>),
    Call(wasmtime::Caller<'a, StoreState<V, H>>),
}

impl<V: 'static, H: 'static> fmt::Debug for WasmContext<'_, V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.0 {
            WasmContextInner::Root(_) => "root",
            WasmContextInner::Call(_) => "call",
        };

        f.debug_tuple("WasmContext").field(&kind).finish()
    }
}

impl<'a, V: HandleValue, H: 'static> WasmContext<'a, V, H> {
    pub fn from_caller(caller: wasmtime::Caller<'a, StoreState<V, H>>) -> Self {
        Self(WasmContextInner::Call(caller))
    }

    fn cx(&self) -> wasmtime::StoreContext<'_, StoreState<V, H>> {
        match &self.0 {
            WasmContextInner::Root(store) => store.as_context(),
            WasmContextInner::Call(caller) => caller.as_context(),
        }
    }

    fn cx_mut(&mut self) -> wasmtime::StoreContextMut<'_, StoreState<V, H>> {
        match &mut self.0 {
            WasmContextInner::Root(store) => store.as_context_mut(),
            WasmContextInner::Call(caller) => caller.as_context_mut(),
        }
    }

    fn exports(&self) -> &BridgeExports {
        self.cx()
            .data()
            .exports
            .as_ref()
            .expect("exports never initialized with `BridgeStoreExt::setup_exports`")
    }
}

fn call_func<V: HandleValue, H: 'static>(
    cx: &mut WasmContext<'_, V, H>,
    func: wasmtime::Func,
    args: &[u32],
) -> anyhow::Result<Option<u32>> {
    let params = args
        .iter()
        .map(|&arg| wasmtime::Val::I32(arg as i32))
        .collect::<Vec<_>>();

    let mut results = vec![wasmtime::Val::I32(0); func.ty(cx.cx()).results().len()];

    func.call(cx.cx_mut(), &params, &mut results)?;

    match results.first() {
        None => Ok(None),
        Some(wasmtime::Val::I32(value)) => Ok(Some(*value as u32)),
        Some(other) => anyhow::bail!("guest function returned a non-i32 value {other:?}"),
    }
}

impl<V: HandleValue, H: 'static> GuestContext for WasmContext<'_, V, H> {
    type Value = V;
    type Host = H;

    fn parts(&mut self) -> GuestParts<'_, V, H> {
        let memory = self.exports().memory;
        let (memory, state) = memory.data_and_store_mut(self.cx_mut());

        GuestParts {
            memory,
            bridge: &mut state.bridge,
            host: &mut state.host,
        }
    }

    fn alloc(&mut self, size: u32) -> anyhow::Result<u32> {
        self.exports()
            .alloc
            .clone()
            .call(self.cx_mut(), size)
            .with_context(|| format!("failed to allocate {size} byte(s) on the guest"))
    }

    fn call_indirect(&mut self, index: u32, args: &[u32]) -> anyhow::Result<u32> {
        let table = self
            .exports()
            .table
            .context("guest does not export an indirect function table")?;

        let func = table
            .get(self.cx_mut(), u64::from(index))
            .and_then(|entry| entry.as_func().flatten().copied())
            .with_context(|| format!("guest function table has no function at {index}"))?;

        Ok(call_func(self, func, args)?.unwrap_or(0))
    }

    fn load_global_argument_ptr(&mut self) -> anyhow::Result<u32> {
        self.exports()
            .global_argument_ptr
            .clone()
            .context("guest does not export a global argument area")?
            .call(self.cx_mut(), ())
    }
}

// === Linker Helpers === //

pub type BridgeLinker<V, H> = wasmtime::Linker<StoreState<V, H>>;

/// Wraps an import's `Caller` into a [`WasmContext`] for the duration of `f`.
pub fn enter<V, H, R>(
    caller: wasmtime::Caller<'_, StoreState<V, H>>,
    f: impl FnOnce(&mut WasmContext<'_, V, H>) -> R,
) -> R
where
    V: HandleValue,
    H: 'static,
{
    f(&mut WasmContext::from_caller(caller))
}
