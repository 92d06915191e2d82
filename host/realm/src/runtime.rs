use anyhow::Context as _;
use tether::{GuestContext as _, Handle};
use tether_wasmtime::{BridgeStoreExt as _, StoreState};

use crate::{
    bindings::{self, HostLinker, HostState},
    call::drain_jobs,
    capability::CapabilityTable,
    config::RuntimeConfig,
    realm::Realm,
    value::HostValue,
};

/// A guest module instantiated against its own realm.
pub struct GuestInstance {
    store: wasmtime::Store<HostState>,
    entry: wasmtime::TypedFunc<(), u32>,
    job_limit: usize,
}

impl GuestInstance {
    /// Binds the capabilities `module` imports, then instantiates it. Fails before running any
    /// guest code if the host lacks one of them.
    pub fn instantiate(
        engine: &wasmtime::Engine,
        module: &wasmtime::Module,
        config: &RuntimeConfig,
    ) -> anyhow::Result<Self> {
        let imports = bindings::resolve_imports(module, &config.import_module)?;

        let capabilities = CapabilityTable::bind(
            &config.descriptors()?,
            imports.iter().filter_map(|import| {
                Some((import.import.capability()?, import.name.as_str()))
            }),
        )?;

        tracing::info!(
            imports = imports.len(),
            ?capabilities,
            "bound guest imports"
        );

        let mut linker = HostLinker::new(engine);
        for import in &imports {
            bindings::define(&mut linker, &config.import_module, import)
                .with_context(|| format!("failed to define import `{}`", import.name))?;
        }

        let realm = Realm::with_capabilities(config.fetch_backend(), capabilities);
        let mut store = wasmtime::Store::new(engine, StoreState::new(realm));

        let instance = linker
            .instantiate(&mut store, module)
            .context("failed to instantiate guest module")?;

        store.setup_exports(instance, &config.export_names())?;

        let entry = instance
            .get_typed_func(&mut store, &config.exports.entry)
            .with_context(|| format!("failed to find guest entry point `{}`", config.exports.entry))?;

        Ok(Self {
            store,
            entry,
            job_limit: config.job_limit,
        })
    }

    /// Calls the entry point, takes ownership of the value it returns, and runs queued jobs until
    /// the realm settles.
    pub fn run(&mut self) -> anyhow::Result<HostValue> {
        let handle = self
            .entry
            .call(&mut self.store, ())
            .context("guest entry point trapped")?;

        let job_limit = self.job_limit;

        self.store.root(|cx| {
            let value = cx.take(Handle::from_raw(handle))?;
            drain_jobs(cx, job_limit)?;
            Ok(value)
        })
    }

    pub fn realm(&self) -> &Realm {
        &self.store.data().host
    }

    pub fn live_handles(&self) -> usize {
        self.store.data().bridge.handles.live_count()
    }
}
