use std::rc::Rc;

use crate::{
    call::{self, Completion, Scope},
    realm::Realm,
    value::{HostFunction, HostValue, Obj, ObjectKind},
};

// === Script === //

/// Source text handed to the `Function` constructor.
///
/// The realm has no script engine, so only the bodies guest glue actually produces are
/// understood. Anything else compiles but throws a `SyntaxError` when called.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    ReturnThis,
    Empty,
    Unknown(Rc<str>),
}

impl Script {
    pub fn compile(source: &str) -> Self {
        let body = source.trim();
        let body = body.strip_suffix(';').unwrap_or(body).trim_end();

        match body {
            "" => Self::Empty,
            "return this" => Self::ReturnThis,
            _ => Self::Unknown(source.into()),
        }
    }

    pub fn run(&self, realm: &mut Realm, this: &HostValue) -> Completion {
        match self {
            // Sloppy-mode functions see the global object for a missing receiver.
            Self::ReturnThis if this.is_nullish() => Ok(realm.global_value()),
            Self::ReturnThis => Ok(this.clone()),
            Self::Empty => Ok(HostValue::Undefined),
            Self::Unknown(source) => Err(HostValue::syntax_error(format!(
                "unsupported function body: {source}"
            ))),
        }
    }
}

// === Capabilities === //

/// `new Function(body)`.
pub fn function_constructor(
    _scope: &mut dyn Scope,
    _this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let source = args
        .last()
        .map(HostValue::to_display_string)
        .unwrap_or_default();

    let script = Script::compile(&source);
    if let Script::Unknown(source) = &script {
        tracing::debug!(%source, "compiled an opaque function body");
    }

    Ok(Ok(Obj::function(HostFunction::Script(script)).into()))
}

/// `Function.prototype.call(thisArg, ...args)`.
pub fn function_call(
    scope: &mut dyn Scope,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let (this_arg, rest) = match args.split_first() {
        Some((first, rest)) => (first.clone(), rest),
        None => (HostValue::Undefined, &[][..]),
    };

    call::call_function(scope, this, &this_arg, rest)
}

/// `new Object()`.
pub fn object_constructor(
    _scope: &mut dyn Scope,
    _this: &HostValue,
    _args: &[HostValue],
) -> anyhow::Result<Completion> {
    Ok(Ok(Obj::plain().into()))
}

/// `Reflect.set(target, key, value)`.
pub fn reflect_set(
    _scope: &mut dyn Scope,
    _this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let Some(target) = args.first().and_then(HostValue::as_object) else {
        return Ok(Err(HostValue::type_error("Reflect.set called on non-object")));
    };

    let key = args.get(1).unwrap_or(&HostValue::Undefined).to_property_key();
    let value = args.get(2).cloned().unwrap_or(HostValue::Undefined);

    // Host functions are sealed.
    if matches!(target.kind(), ObjectKind::Function(_)) {
        return Ok(Ok(HostValue::Bool(false)));
    }

    target.set(key, value);
    Ok(Ok(HostValue::Bool(true)))
}
