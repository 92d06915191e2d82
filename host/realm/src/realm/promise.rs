use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use crate::{
    call::{self, Completion, Scope},
    realm::{Job, Realm, net},
    value::{HostFunction, HostValue, Obj, ObjectKind},
};

// === PromiseCell === //

#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(HostValue),
    Rejected(HostValue),
}

#[derive(Default)]
pub struct PromiseCell {
    state: RefCell<Option<Completion>>,
    reactions: RefCell<Vec<Reaction>>,
}

impl fmt::Debug for PromiseCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseCell")
            .field("state", &self.state())
            .field("reactions", &self.reactions.borrow().len())
            .finish()
    }
}

impl PromiseCell {
    pub fn state(&self) -> PromiseState {
        match &*self.state.borrow() {
            None => PromiseState::Pending,
            Some(Ok(value)) => PromiseState::Fulfilled(value.clone()),
            Some(Err(reason)) => PromiseState::Rejected(reason.clone()),
        }
    }
}

/// What happens when a promise settles.
#[derive(Debug)]
pub enum Reaction {
    Then {
        derived: Obj,
        on_fulfilled: HostValue,
        on_rejected: HostValue,
    },
    /// Settles `target` the same way. Used when one promise adopts another.
    Forward { target: Obj },
}

pub fn new_promise() -> Obj {
    Obj::new(ObjectKind::Promise(PromiseCell::default()))
}

fn cell(promise: &Obj) -> Option<&PromiseCell> {
    match promise.kind() {
        ObjectKind::Promise(cell) => Some(cell),
        _ => None,
    }
}

pub fn state(value: &HostValue) -> Option<PromiseState> {
    cell(value.as_object()?).map(PromiseCell::state)
}

/// Resolves `promise` with `value`, adopting the state of `value` if it is itself a promise.
pub fn resolve(realm: &mut Realm, promise: &Obj, value: HostValue) {
    match &value {
        HostValue::Object(obj) if obj == promise => {
            let reason = HostValue::type_error("Chaining cycle detected for promise");
            settle(realm, promise, Err(reason));
        }
        HostValue::Object(obj) if cell(obj).is_some() => {
            realm.enqueue(Job::Adopt {
                target: promise.clone(),
                source: obj.clone(),
            });
        }
        _ => settle(realm, promise, Ok(value)),
    }
}

pub fn reject(realm: &mut Realm, promise: &Obj, reason: HostValue) {
    settle(realm, promise, Err(reason));
}

fn settle(realm: &mut Realm, promise: &Obj, outcome: Completion) {
    let Some(cell) = cell(promise) else {
        return;
    };

    {
        let mut state = cell.state.borrow_mut();
        if state.is_some() {
            return;
        }
        *state = Some(outcome.clone());
    }

    for reaction in cell.reactions.take() {
        realm.enqueue(Job::Reaction {
            reaction,
            outcome: outcome.clone(),
        });
    }
}

fn subscribe(realm: &mut Realm, promise: &Obj, reaction: Reaction) {
    let Some(cell) = cell(promise) else {
        return;
    };

    match &*cell.state.borrow() {
        Some(outcome) => realm.enqueue(Job::Reaction {
            reaction,
            outcome: outcome.clone(),
        }),
        None => cell.reactions.borrow_mut().push(reaction),
    }
}

pub fn then(
    realm: &mut Realm,
    promise: &Obj,
    on_fulfilled: HostValue,
    on_rejected: HostValue,
) -> Obj {
    let derived = new_promise();

    subscribe(
        realm,
        promise,
        Reaction::Then {
            derived: derived.clone(),
            on_fulfilled,
            on_rejected,
        },
    );

    derived
}

// === Resolving Functions === //

/// One of the `resolve`/`reject` pair handed to a promise executor. The pair shares a flag so
/// that only the first call has any effect.
pub struct Resolver {
    promise: Obj,
    rejects: bool,
    already_resolved: Rc<Cell<bool>>,
}

impl Resolver {
    pub fn settle(&self, realm: &mut Realm, value: HostValue) {
        if self.already_resolved.replace(true) {
            return;
        }

        if self.rejects {
            reject(realm, &self.promise, value);
        } else {
            resolve(realm, &self.promise, value);
        }
    }
}

pub fn resolving_functions(promise: &Obj) -> (HostValue, HostValue) {
    let already_resolved = Rc::new(Cell::new(false));

    let make = |rejects| {
        HostValue::Object(Obj::function(HostFunction::Resolver(Resolver {
            promise: promise.clone(),
            rejects,
            already_resolved: already_resolved.clone(),
        })))
    };

    (make(false), make(true))
}

// === Jobs === //

pub fn run_job(scope: &mut dyn Scope, job: Job) -> anyhow::Result<()> {
    match job {
        Job::Reaction { reaction, outcome } => run_reaction(scope, reaction, outcome)?,
        Job::Adopt { target, source } => {
            subscribe(scope.realm(), &source, Reaction::Forward { target });
        }
        Job::Fetch { promise, request } => net::complete_fetch(scope.realm(), &promise, request),
        Job::ParseJson { promise, body } => net::complete_json(scope.realm(), &promise, &body),
    }

    Ok(())
}

fn run_reaction(
    scope: &mut dyn Scope,
    reaction: Reaction,
    outcome: Completion,
) -> anyhow::Result<()> {
    let (derived, handler) = match reaction {
        Reaction::Forward { target } => {
            forward(scope.realm(), &target, outcome);
            return Ok(());
        }
        Reaction::Then {
            derived,
            on_fulfilled,
            on_rejected,
        } => {
            let handler = if outcome.is_ok() { on_fulfilled } else { on_rejected };
            (derived, handler)
        }
    };

    if !handler.is_callable() {
        forward(scope.realm(), &derived, outcome);
        return Ok(());
    }

    let argument = match outcome {
        Ok(value) | Err(value) => value,
    };

    match call::call_function(scope, &handler, &HostValue::Undefined, &[argument])? {
        Ok(value) => resolve(scope.realm(), &derived, value),
        Err(reason) => reject(scope.realm(), &derived, reason),
    }

    Ok(())
}

fn forward(realm: &mut Realm, target: &Obj, outcome: Completion) {
    match outcome {
        Ok(value) => resolve(realm, target, value),
        Err(reason) => reject(realm, target, reason),
    }
}

// === Capabilities === //

/// `new Promise(executor)`.
pub fn promise_constructor(
    scope: &mut dyn Scope,
    _this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let executor = args.first().cloned().unwrap_or(HostValue::Undefined);

    if !executor.is_callable() {
        return Ok(Err(HostValue::type_error(format!(
            "Promise resolver {} is not a function",
            executor.to_display_string()
        ))));
    }

    let promise = new_promise();
    let (resolve_fn, reject_fn) = resolving_functions(&promise);

    if let Err(reason) = call::call_function(
        scope,
        &executor,
        &HostValue::Undefined,
        &[resolve_fn, reject_fn.clone()],
    )? {
        let _ = call::call_function(scope, &reject_fn, &HostValue::Undefined, &[reason])?;
    }

    Ok(Ok(promise.into()))
}

/// `Promise.prototype.then(onFulfilled, onRejected)`.
pub fn promise_then(
    scope: &mut dyn Scope,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let Some(promise) = this.as_object().filter(|obj| cell(obj).is_some()) else {
        return Ok(Err(HostValue::type_error(
            "Method Promise.prototype.then called on incompatible receiver",
        )));
    };

    let on_fulfilled = args.first().cloned().unwrap_or(HostValue::Undefined);
    let on_rejected = args.get(1).cloned().unwrap_or(HostValue::Undefined);

    let derived = then(scope.realm(), promise, on_fulfilled, on_rejected);
    Ok(Ok(derived.into()))
}

#[cfg(test)]
mod tests {
    use tether::{GuestContext as _, sandbox::Sandbox};

    use super::*;
    use crate::call::{NativeMethod, drain_jobs};

    fn sandbox() -> Sandbox<HostValue, Realm> {
        Sandbox::new(Realm::default())
    }

    fn native(name: &'static str, method: NativeMethod) -> HostValue {
        Obj::function(HostFunction::Native { name, method }).into()
    }

    fn double(
        _: &mut dyn Scope,
        _: &HostValue,
        args: &[HostValue],
    ) -> anyhow::Result<Completion> {
        Ok(Ok(HostValue::Number(args[0].as_number().unwrap_or(0.0) * 2.0)))
    }

    fn explode(_: &mut dyn Scope, _: &HostValue, _: &[HostValue]) -> anyhow::Result<Completion> {
        Ok(Err(HostValue::from("boom")))
    }

    #[test]
    fn reactions_run_as_jobs_in_order() {
        let mut sb = sandbox();
        let promise = new_promise();

        let first = then(sb.host(), &promise, native("double", double), HostValue::Undefined);
        let second = then(sb.host(), &first, native("double", double), HostValue::Undefined);

        resolve(sb.host(), &promise, 3.0.into());
        assert_eq!(cell(&first).unwrap().state(), PromiseState::Pending);

        assert_eq!(drain_jobs(&mut sb, 16).unwrap(), 2);
        assert_eq!(cell(&second).unwrap().state(), PromiseState::Fulfilled(12.0.into()));
    }

    #[test]
    fn thrown_handler_rejects_derived_promise() {
        let mut sb = sandbox();
        let promise = new_promise();

        let derived = then(sb.host(), &promise, native("explode", explode), HostValue::Undefined);
        let recovered = then(sb.host(), &derived, HostValue::Undefined, native("double", double));

        resolve(sb.host(), &promise, 1.0.into());
        drain_jobs(&mut sb, 16).unwrap();

        assert_eq!(cell(&derived).unwrap().state(), PromiseState::Rejected("boom".into()));
        // "boom" is not a number, so the recovery handler doubles zero.
        assert_eq!(cell(&recovered).unwrap().state(), PromiseState::Fulfilled(0.0.into()));
    }

    #[test]
    fn resolving_with_a_promise_adopts_it() {
        let mut sb = sandbox();
        let inner = new_promise();
        let outer = new_promise();

        resolve(sb.host(), &outer, inner.clone().into());
        reject(sb.host(), &inner, "nope".into());
        drain_jobs(&mut sb, 16).unwrap();

        assert_eq!(cell(&outer).unwrap().state(), PromiseState::Rejected("nope".into()));
    }

    #[test]
    fn self_resolution_is_a_type_error() {
        let mut sb = sandbox();
        let promise = new_promise();

        resolve(sb.host(), &promise, promise.clone().into());

        let PromiseState::Rejected(reason) = cell(&promise).unwrap().state() else {
            panic!("promise should be rejected");
        };
        assert!(reason.to_display_string().starts_with("TypeError"));
    }

    #[test]
    fn resolvers_only_settle_once() {
        let mut sb = sandbox();
        let promise = new_promise();
        let (resolve_fn, reject_fn) = resolving_functions(&promise);

        call::call_function(&mut sb, &resolve_fn, &HostValue::Undefined, &[1.0.into()])
            .unwrap()
            .unwrap();
        call::call_function(&mut sb, &reject_fn, &HostValue::Undefined, &[2.0.into()])
            .unwrap()
            .unwrap();

        assert_eq!(cell(&promise).unwrap().state(), PromiseState::Fulfilled(1.0.into()));
    }

    #[test]
    fn job_limit_is_enforced() {
        let mut sb = sandbox();
        let promise = new_promise();

        for _ in 0..3 {
            then(sb.host(), &promise, HostValue::Undefined, HostValue::Undefined);
        }
        resolve(sb.host(), &promise, HostValue::Null);

        assert!(drain_jobs(&mut sb, 2).is_err());
    }
}
