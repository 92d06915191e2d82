use std::{cell::Cell, fmt};

use scopeguard::ScopeGuard;
use thiserror::Error;

use crate::context::GuestContext;

// === ClosureRecord === //

#[derive(Debug, Copy, Clone, Error, Eq, PartialEq)]
pub enum ClosureError {
    #[error("guest closure was invoked after it was destroyed")]
    Destroyed,

    #[error("guest closure was dropped more than once")]
    AlreadyDropped,
}

/// A guest function-table entry bound to two context words, callable from the host.
///
/// The record tracks in-flight invocations so that an explicit drop requested while the closure
/// is still running defers the destructor until the outermost invocation returns.
pub struct ClosureRecord {
    func: u32,
    dtor: Option<u32>,
    a: Cell<u32>,
    b: u32,
    pending: Cell<u32>,
    drop_requested: Cell<bool>,
    finalized: Cell<bool>,
}

impl fmt::Debug for ClosureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureRecord")
            .field("func", &self.func)
            .field("dtor", &self.dtor)
            .field("pending", &self.pending.get())
            .field("finalized", &self.finalized.get())
            .finish_non_exhaustive()
    }
}

/// A destructor that became due when an invocation finished.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DestructorCall {
    pub func: u32,
    pub a: u32,
    pub b: u32,
}

impl ClosureRecord {
    pub fn new(func: u32, dtor: Option<u32>, a: u32, b: u32) -> Self {
        Self {
            func,
            dtor,
            a: Cell::new(a),
            b,
            pending: Cell::new(0),
            drop_requested: Cell::new(false),
            finalized: Cell::new(false),
        }
    }

    /// A closure borrowed from the guest's stack for the duration of a single import call. It has
    /// no destructor and must be [invalidated](Self::invalidate) before the import returns.
    pub fn scoped(func: u32, a: u32, b: u32) -> Self {
        Self::new(func, None, a, b)
    }

    pub fn func(&self) -> u32 {
        self.func
    }

    pub fn pending(&self) -> u32 {
        self.pending.get()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.get()
    }

    /// Marks the start of an invocation, returning the context word to pass to the guest.
    pub fn begin(&self) -> Result<u32, ClosureError> {
        if self.finalized.get() {
            return Err(ClosureError::Destroyed);
        }

        self.pending.set(self.pending.get() + 1);

        // Nested invocations observe a zeroed context word until the outer one returns.
        Ok(self.a.replace(0))
    }

    /// Marks the end of an invocation started with [`begin`](Self::begin).
    pub fn finish(&self, a: u32) -> Option<DestructorCall> {
        self.a.set(a);

        let pending = self.pending.get() - 1;
        self.pending.set(pending);

        if pending > 0 || !self.drop_requested.get() {
            return None;
        }

        self.finalize().map(|func| DestructorCall {
            func,
            a,
            b: self.b,
        })
    }

    /// Requests that the closure be destroyed. Returns `true` if nothing was in flight, in which
    /// case the guest is responsible for freeing its side right away.
    pub fn request_drop(&self) -> Result<bool, ClosureError> {
        if self.drop_requested.replace(true) {
            return Err(ClosureError::AlreadyDropped);
        }

        if self.pending.get() > 0 {
            tracing::trace!(func = self.func, "deferring closure destructor");
            return Ok(false);
        }

        self.finalize();
        Ok(true)
    }

    /// Finalizes the closure without running its destructor.
    pub fn invalidate(&self) {
        self.finalize();
    }

    fn finalize(&self) -> Option<u32> {
        if self.finalized.replace(true) {
            return None;
        }

        self.a.set(0);
        self.dtor
    }
}

/// Invokes `record` with `args` appended to its context words.
///
/// The destructor runs right after the call if this was the last in-flight invocation of a
/// closure the guest already dropped.
pub fn invoke_closure<C>(cx: &mut C, record: &ClosureRecord, args: &[u32]) -> anyhow::Result<u32>
where
    C: ?Sized + GuestContext,
{
    let a = record.begin()?;
    let guard = scopeguard::guard(a, |a| {
        // Only reached when the guest call unwinds.
        record.finish(a);
    });

    let mut full_args = Vec::with_capacity(args.len() + 2);
    full_args.extend([a, record.b]);
    full_args.extend_from_slice(args);

    let result = cx.call_indirect(record.func, &full_args);

    if let Some(dtor) = record.finish(ScopeGuard::into_inner(guard)) {
        tracing::trace!(func = record.func, dtor = dtor.func, "running closure destructor");
        cx.call_indirect(dtor.func, &[dtor.a, dtor.b])?;
    }

    result
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::sandbox::{Sandbox, SandboxValue};

    #[derive(Default)]
    struct Log {
        calls: Vec<Vec<u32>>,
        dtors: Vec<(u32, u32)>,
        record: Option<Rc<ClosureRecord>>,
    }

    #[test]
    fn destructor_waits_for_outermost_invocation() {
        let mut sb = Sandbox::<SandboxValue, Log>::new(Log::default());

        let dtor = sb.define(|sb, args| {
            sb.host().dtors.push((args[0], args[1]));
            Ok(0)
        });

        let func = sb.define(|sb, args| {
            sb.host().calls.push(args.to_vec());
            let record = sb.host().record.clone().expect("record installed");

            if args[2] == 1 {
                assert_eq!(invoke_closure(sb, &record, &[2])?, 20);
                assert_eq!(record.request_drop(), Ok(false));
                assert!(sb.host().dtors.is_empty());
            }

            Ok(args[2] * 10)
        });

        let record = Rc::new(ClosureRecord::new(func, Some(dtor), 100, 200));
        sb.host().record = Some(record.clone());

        assert_eq!(invoke_closure(&mut sb, &record, &[1]).unwrap(), 10);

        assert_eq!(sb.host().calls, vec![vec![100, 200, 1], vec![0, 200, 2]]);
        assert_eq!(sb.host().dtors, vec![(100, 200)]);
        assert!(record.is_finalized());
        assert_eq!(record.pending(), 0);

        let err = invoke_closure(&mut sb, &record, &[3]).unwrap_err();
        assert_eq!(err.downcast_ref(), Some(&ClosureError::Destroyed));
        assert_eq!(sb.host().calls.len(), 2);
    }

    #[test]
    fn idle_drop_hands_destruction_to_guest() {
        let mut sb = Sandbox::<SandboxValue, Log>::new(Log::default());
        let dtor = sb.define(|sb, args| {
            sb.host().dtors.push((args[0], args[1]));
            Ok(0)
        });
        let func = sb.define(|_, _| Ok(0));

        let record = ClosureRecord::new(func, Some(dtor), 1, 2);
        assert_eq!(invoke_closure(&mut sb, &record, &[]).unwrap(), 0);

        assert_eq!(record.request_drop(), Ok(true));
        assert_eq!(record.request_drop(), Err(ClosureError::AlreadyDropped));
        assert!(sb.host().dtors.is_empty());
        assert!(invoke_closure(&mut sb, &record, &[]).is_err());
    }

    #[test]
    fn scoped_closure_dies_with_its_import() {
        let mut sb = Sandbox::<SandboxValue, Log>::new(Log::default());
        let func = sb.define(|_, args| Ok(args[0] + args[1]));

        let record = ClosureRecord::scoped(func, 3, 4);
        assert_eq!(invoke_closure(&mut sb, &record, &[]).unwrap(), 7);

        record.invalidate();
        assert_eq!(record.begin(), Err(ClosureError::Destroyed));
    }

    #[test]
    fn failed_invocation_still_settles_state() {
        let mut sb = Sandbox::<SandboxValue, Log>::new(Log::default());
        let func = sb.define(|_, _| anyhow::bail!("guest trapped"));

        let record = ClosureRecord::new(func, None, 9, 0);
        assert!(invoke_closure(&mut sb, &record, &[]).is_err());

        assert_eq!(record.pending(), 0);
        assert_eq!(record.begin(), Ok(9));
    }
}
