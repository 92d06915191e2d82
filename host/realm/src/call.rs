use tether::{ClosureError, ClosureRecord, GuestContext, Handle, invoke_closure};

use crate::{
    realm::{Realm, promise},
    value::{HostFunction, HostValue, ObjectKind},
};

// === Scope === //

/// The outcome of running host code: `Ok` for a normal return, `Err` for a thrown value.
pub type Completion = Result<HostValue, HostValue>;

/// A host capability implementation. `Err` from the outer result is a fault in the bridge itself
/// and aborts the guest; thrown values travel in the [`Completion`].
pub type NativeMethod =
    fn(&mut dyn Scope, this: &HostValue, args: &[HostValue]) -> anyhow::Result<Completion>;

/// What host code may do while servicing a guest call.
pub trait Scope {
    fn realm(&mut self) -> &mut Realm;

    /// Re-enters the guest through `record`, handing it ownership of `args`.
    fn call_guest(&mut self, record: &ClosureRecord, args: &[HostValue])
    -> anyhow::Result<HostValue>;
}

/// A guest context whose handles refer to [`HostValue`]s and whose host is a [`Realm`].
pub trait HostContext: GuestContext<Value = HostValue, Host = Realm> {}

impl<C: GuestContext<Value = HostValue, Host = Realm>> HostContext for C {}

impl<C: HostContext> Scope for C {
    fn realm(&mut self) -> &mut Realm {
        self.host()
    }

    fn call_guest(
        &mut self,
        record: &ClosureRecord,
        args: &[HostValue],
    ) -> anyhow::Result<HostValue> {
        // Arguments are only handed over to a closure that can still run.
        if record.is_finalized() {
            return Err(ClosureError::Destroyed.into());
        }

        let handles = args
            .iter()
            .map(|arg| self.alloc_handle(arg.clone()).raw())
            .collect::<Vec<_>>();

        let ret = invoke_closure(self, record, &handles)?;
        self.take(Handle::from_raw(ret))
    }
}

// === Calls === //

pub fn call_function(
    scope: &mut dyn Scope,
    func: &HostValue,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let function = match func.as_object().map(|obj| obj.kind()) {
        Some(ObjectKind::Function(function)) => function,
        _ => {
            return Ok(Err(HostValue::type_error(format!(
                "{} is not a function",
                func.to_display_string()
            ))));
        }
    };

    match function {
        HostFunction::Native { method, .. } => method(scope, this, args),
        HostFunction::Resolver(resolver) => {
            let value = args.first().cloned().unwrap_or(HostValue::Undefined);
            resolver.settle(scope.realm(), value);
            Ok(Ok(HostValue::Undefined))
        }
        HostFunction::Guest(record) => {
            let record = record.clone();
            scope.call_guest(&record, args).map(Ok)
        }
        HostFunction::Script(script) => Ok(script.run(scope.realm(), this)),
    }
}

/// Runs queued jobs until the queue is empty, failing if more than `limit` jobs run.
pub fn drain_jobs(scope: &mut dyn Scope, limit: usize) -> anyhow::Result<usize> {
    let mut steps = 0;

    while let Some(job) = scope.realm().next_job() {
        if steps == limit {
            anyhow::bail!("job queue did not settle within {limit} step(s)");
        }

        steps += 1;
        promise::run_job(scope, job)?;
    }

    if steps > 0 {
        tracing::debug!(steps, "drained job queue");
    }

    Ok(steps)
}
