//! Boundary-safe trampolines behind each guest import.
//!
//! Shims speak raw `u32` handles and pointers on one side and [`HostValue`]s on the other. Host
//! capabilities are looked up in the instance's [`CapabilityTable`](crate::capability) at call
//! time, so a shim can only reach what was bound for its guest.

use std::rc::Rc;

use thiserror::Error;
use tether::{ClosureError, ClosureRecord, ExnSlot, Handle, transport};

use crate::{
    call::{Completion, HostContext},
    capability::CapabilityId,
    json::{self, JsonError},
    value::{HostFunction, HostValue, Obj, ObjectKind},
};

#[derive(Debug, Error)]
pub enum ShimError {
    #[error("guest threw: {0}")]
    GuestThrow(String),
    #[error("uncaught exception in `{capability}`: {message}")]
    Uncaught {
        capability: CapabilityId,
        message: String,
    },
    #[error("handle {0:?} does not refer to a guest closure")]
    NotAClosure(Handle),
    #[error(transparent)]
    Closure(#[from] ClosureError),
    #[error(transparent)]
    Json(#[from] JsonError),
}

// === Helpers === //

fn value<C: HostContext>(cx: &mut C, raw: u32) -> anyhow::Result<HostValue> {
    cx.resolve(Handle::from_raw(raw))
}

fn handle<C: HostContext>(cx: &mut C, value: HostValue) -> u32 {
    cx.alloc_handle(value).raw()
}

/// Like [`handle`] but maps `null` and `undefined` to handle 0.
fn nullable_handle<C: HostContext>(cx: &mut C, value: HostValue) -> u32 {
    if value.is_nullish() {
        0
    } else {
        handle(cx, value)
    }
}

fn invoke<C: HostContext>(
    cx: &mut C,
    id: CapabilityId,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let method = cx.host().capabilities().method(id)?;
    method(cx, this, args)
}

/// Invokes a capability whose import has no exception slot. A throw there has nowhere to go, so
/// it aborts the guest call.
fn invoke_infallible<C: HostContext>(
    cx: &mut C,
    id: CapabilityId,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<HostValue> {
    invoke(cx, id, this, args)?.map_err(|thrown| {
        ShimError::Uncaught {
            capability: id,
            message: thrown.to_display_string(),
        }
        .into()
    })
}

/// Invokes a capability whose import carries an exception slot at `exn`, returning the result as
/// a fresh handle.
fn invoke_fallible<C: HostContext>(
    cx: &mut C,
    id: CapabilityId,
    exn: u32,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<u32> {
    let outcome = invoke(cx, id, this, args)?.map(|value| handle(cx, value));
    transport(cx, ExnSlot::new(exn), outcome)
}

fn is_kind<C: HostContext>(
    cx: &mut C,
    raw: u32,
    pred: impl FnOnce(&ObjectKind) -> bool,
) -> anyhow::Result<u32> {
    let value = value(cx, raw)?;
    Ok(value.as_object().is_some_and(|obj| pred(obj.kind())) as u32)
}

// === Intrinsics === //

pub fn object_clone_ref<C: HostContext>(cx: &mut C, idx: u32) -> anyhow::Result<u32> {
    Ok(cx.handles().retain(Handle::from_raw(idx))?.raw())
}

pub fn object_drop_ref<C: HostContext>(cx: &mut C, idx: u32) -> anyhow::Result<()> {
    Ok(cx.handles().release(Handle::from_raw(idx))?)
}

pub fn string_new<C: HostContext>(cx: &mut C, ptr: u32, len: u32) -> anyhow::Result<u32> {
    let text = cx.read_str(ptr, len)?;
    Ok(handle(cx, HostValue::string(text)))
}

/// Reads a number, raising the byte at `invalid` if the value is not one.
pub fn number_get<C: HostContext>(cx: &mut C, idx: u32, invalid: u32) -> anyhow::Result<f64> {
    match value(cx, idx)? {
        HostValue::Number(value) => Ok(value),
        _ => {
            cx.write_byte(invalid, 1)?;
            Ok(0.0)
        }
    }
}

pub fn is_null<C: HostContext>(cx: &mut C, idx: u32) -> anyhow::Result<u32> {
    Ok(matches!(value(cx, idx)?, HostValue::Null) as u32)
}

pub fn is_undefined<C: HostContext>(cx: &mut C, idx: u32) -> anyhow::Result<u32> {
    Ok(matches!(value(cx, idx)?, HostValue::Undefined) as u32)
}

/// `0` for false, `1` for true, `2` for anything that is not a boolean.
pub fn boolean_get<C: HostContext>(cx: &mut C, idx: u32) -> anyhow::Result<u32> {
    Ok(match value(cx, idx)? {
        HostValue::Bool(value) => value as u32,
        _ => 2,
    })
}

pub fn is_symbol<C: HostContext>(cx: &mut C, idx: u32) -> anyhow::Result<u32> {
    Ok(matches!(value(cx, idx)?, HostValue::Symbol(_)) as u32)
}

/// Copies a string into guest memory, writing its length to `len_ptr` and returning its address.
/// Returns 0 if the value is not a string.
pub fn string_get<C: HostContext>(cx: &mut C, idx: u32, len_ptr: u32) -> anyhow::Result<u32> {
    let HostValue::String(text) = value(cx, idx)? else {
        return Ok(0);
    };

    let (ptr, len) = cx.write_str(&text)?;
    cx.write_word(len_ptr, len)?;
    Ok(ptr)
}

/// Drops the guest's reference to a closure. Returns 1 if the guest should free its side now.
pub fn cb_drop<C: HostContext>(cx: &mut C, idx: u32) -> anyhow::Result<u32> {
    let handle = Handle::from_raw(idx);
    let function = cx.take(handle)?;

    let record = match function.as_object().map(Obj::kind) {
        Some(ObjectKind::Function(HostFunction::Guest(record))) => record.clone(),
        _ => return Err(ShimError::NotAClosure(handle).into()),
    };

    let now = record.request_drop().map_err(ShimError::from)?;
    Ok(now as u32)
}

/// Writes the JSON text of a value into guest memory. The text's address goes to `ptrptr`; its
/// length is returned.
pub fn json_serialize<C: HostContext>(cx: &mut C, idx: u32, ptrptr: u32) -> anyhow::Result<u32> {
    let value = value(cx, idx)?;
    let text = json::stringify(&value).map_err(ShimError::from)?;

    let (ptr, len) = cx.write_str(&text)?;
    cx.write_word(ptrptr, ptr)?;
    Ok(len)
}

/// Wraps guest table entry `func` with context words `a` and `b` into a host function. `dtor` is
/// the table entry freeing the guest's side once the closure is dropped.
pub fn closure_wrapper<C: HostContext>(
    cx: &mut C,
    a: u32,
    b: u32,
    func: u32,
    dtor: u32,
) -> anyhow::Result<u32> {
    let record = ClosureRecord::new(func, Some(dtor), a, b);
    let function = Obj::function(HostFunction::Guest(Rc::new(record)));

    Ok(handle(cx, function.into()))
}

pub fn throw<C: HostContext>(cx: &mut C, ptr: u32, len: u32) -> anyhow::Result<()> {
    let message = cx.read_str(ptr, len)?;
    tracing::warn!("guest threw: {message}");

    Err(ShimError::GuestThrow(message).into())
}

// === DOM === //

pub fn create_element_document<C: HostContext>(
    cx: &mut C,
    this: u32,
    ptr: u32,
    len: u32,
    exn: u32,
) -> anyhow::Result<u32> {
    let this = value(cx, this)?;
    let tag = cx.read_str(ptr, len)?;

    invoke_fallible(cx, CapabilityId::CreateElement, exn, &this, &[tag.as_str().into()])
}

pub fn body_document<C: HostContext>(cx: &mut C, this: u32) -> anyhow::Result<u32> {
    let this = value(cx, this)?;
    let body = invoke_infallible(cx, CapabilityId::DocumentBody, &this, &[])?;

    Ok(nullable_handle(cx, body))
}

pub fn set_inner_html_element<C: HostContext>(
    cx: &mut C,
    this: u32,
    ptr: u32,
    len: u32,
) -> anyhow::Result<()> {
    let this = value(cx, this)?;
    let markup = cx.read_str(ptr, len)?;

    invoke_infallible(cx, CapabilityId::SetInnerHtml, &this, &[markup.as_str().into()])?;
    Ok(())
}

pub fn append_child_node<C: HostContext>(
    cx: &mut C,
    this: u32,
    child: u32,
    exn: u32,
) -> anyhow::Result<u32> {
    let this = value(cx, this)?;
    let child = value(cx, child)?;

    invoke_fallible(cx, CapabilityId::AppendChild, exn, &this, &[child])
}

pub fn instanceof_window<C: HostContext>(cx: &mut C, idx: u32) -> anyhow::Result<u32> {
    is_kind(cx, idx, |kind| matches!(kind, ObjectKind::Window(_)))
}

pub fn document_window<C: HostContext>(cx: &mut C, this: u32) -> anyhow::Result<u32> {
    let this = value(cx, this)?;
    let document = invoke_infallible(cx, CapabilityId::WindowDocument, &this, &[])?;

    Ok(nullable_handle(cx, document))
}

// === Networking === //

pub fn set_headers<C: HostContext>(
    cx: &mut C,
    this: u32,
    name_ptr: u32,
    name_len: u32,
    value_ptr: u32,
    value_len: u32,
    exn: u32,
) -> anyhow::Result<()> {
    let this = value(cx, this)?;
    let name = cx.read_str(name_ptr, name_len)?;
    let header = cx.read_str(value_ptr, value_len)?;

    let outcome = invoke(cx, CapabilityId::HeadersSet, &this, &[
        name.as_str().into(),
        header.as_str().into(),
    ])?
    .map(drop);

    transport(cx, ExnSlot::new(exn), outcome)
}

pub fn new_request<C: HostContext>(
    cx: &mut C,
    url_ptr: u32,
    url_len: u32,
    init: u32,
    exn: u32,
) -> anyhow::Result<u32> {
    let url = cx.read_str(url_ptr, url_len)?;
    let init = value(cx, init)?;

    invoke_fallible(cx, CapabilityId::RequestConstructor, exn, &HostValue::Undefined, &[
        url.as_str().into(),
        init,
    ])
}

pub fn headers_request<C: HostContext>(cx: &mut C, this: u32) -> anyhow::Result<u32> {
    let this = value(cx, this)?;
    let headers = invoke_infallible(cx, CapabilityId::RequestHeaders, &this, &[])?;

    Ok(handle(cx, headers))
}

pub fn instanceof_response<C: HostContext>(cx: &mut C, idx: u32) -> anyhow::Result<u32> {
    is_kind(cx, idx, |kind| matches!(kind, ObjectKind::Response(_)))
}

pub fn json_response<C: HostContext>(cx: &mut C, this: u32, exn: u32) -> anyhow::Result<u32> {
    let this = value(cx, this)?;
    invoke_fallible(cx, CapabilityId::ResponseJson, exn, &this, &[])
}

pub fn fetch_with_request_window<C: HostContext>(
    cx: &mut C,
    this: u32,
    request: u32,
) -> anyhow::Result<u32> {
    let this = value(cx, this)?;
    let request = value(cx, request)?;
    let promise = invoke_infallible(cx, CapabilityId::WindowFetch, &this, &[request])?;

    Ok(handle(cx, promise))
}

// === Reflection === //

pub fn newnoargs_function<C: HostContext>(cx: &mut C, ptr: u32, len: u32) -> anyhow::Result<u32> {
    let source = cx.read_str(ptr, len)?;
    let function = invoke_infallible(cx, CapabilityId::FunctionConstructor, &HostValue::Undefined, &[
        source.as_str().into(),
    ])?;

    Ok(handle(cx, function))
}

/// `func.call(this_arg)`.
pub fn call_function<C: HostContext>(
    cx: &mut C,
    func: u32,
    this_arg: u32,
    exn: u32,
) -> anyhow::Result<u32> {
    let func = value(cx, func)?;
    let this_arg = value(cx, this_arg)?;

    invoke_fallible(cx, CapabilityId::FunctionCall, exn, &func, &[this_arg])
}

/// `func.call(this_arg, arg)`.
pub fn call_function_1<C: HostContext>(
    cx: &mut C,
    func: u32,
    this_arg: u32,
    arg: u32,
    exn: u32,
) -> anyhow::Result<u32> {
    let func = value(cx, func)?;
    let this_arg = value(cx, this_arg)?;
    let arg = value(cx, arg)?;

    invoke_fallible(cx, CapabilityId::FunctionCall, exn, &func, &[this_arg, arg])
}

pub fn new_object<C: HostContext>(cx: &mut C) -> anyhow::Result<u32> {
    let obj = invoke_infallible(cx, CapabilityId::ObjectConstructor, &HostValue::Undefined, &[])?;
    Ok(handle(cx, obj))
}

/// `Reflect.set(target, key, value)`, returning 1 on success.
pub fn set_reflect<C: HostContext>(
    cx: &mut C,
    target: u32,
    key: u32,
    new_value: u32,
    exn: u32,
) -> anyhow::Result<u32> {
    let args = [value(cx, target)?, value(cx, key)?, value(cx, new_value)?];

    let outcome = invoke(cx, CapabilityId::ReflectSet, &HostValue::Undefined, &args)?
        .map(|done| matches!(done, HostValue::Bool(true)) as u32);

    transport(cx, ExnSlot::new(exn), outcome)
}

// === Promises === //

/// `new Promise(executor)`, where the executor is guest table entry `func` bound to the first two
/// words of the global argument area. The executor only lives for the duration of this call.
pub fn new_promise<C: HostContext>(cx: &mut C, func: u32) -> anyhow::Result<u32> {
    let a = cx.global_argument(0)?;
    let b = cx.global_argument(1)?;

    let record = Rc::new(ClosureRecord::scoped(func, a, b));
    let _invalidate = scopeguard::guard(record.clone(), |record| record.invalidate());

    let executor = Obj::function(HostFunction::Guest(record));
    let promise = invoke_infallible(cx, CapabilityId::PromiseConstructor, &HostValue::Undefined, &[
        executor.into(),
    ])?;

    Ok(handle(cx, promise))
}

pub fn then_promise<C: HostContext>(
    cx: &mut C,
    this: u32,
    on_fulfilled: u32,
    on_rejected: u32,
) -> anyhow::Result<u32> {
    let this = value(cx, this)?;
    let on_fulfilled = value(cx, on_fulfilled)?;
    let on_rejected = value(cx, on_rejected)?;

    let derived = invoke_infallible(cx, CapabilityId::PromiseThen, &this, &[
        on_fulfilled,
        on_rejected,
    ])?;

    Ok(handle(cx, derived))
}
