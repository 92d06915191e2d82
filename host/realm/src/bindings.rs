//! Maps a guest module's imports onto shims and defines them on a wasmtime linker.

use anyhow::Context as _;
use tether_wasmtime::{BridgeLinker, StoreState, enter};
use wasmtime::{Caller, ExternType};

use crate::{capability::CapabilityId, realm::Realm, shims, value::HostValue};

pub type HostState = StoreState<HostValue, Realm>;

pub type HostLinker = BridgeLinker<HostValue, Realm>;

// === Import === //

/// Every import a guest may request.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub enum Import {
    ObjectCloneRef,
    ObjectDropRef,
    StringNew,
    NumberGet,
    IsNull,
    IsUndefined,
    BooleanGet,
    IsSymbol,
    StringGet,
    CbDrop,
    JsonSerialize,
    ClosureWrapper,
    Throw,
    CreateElementDocument,
    BodyDocument,
    SetInnerHtmlElement,
    SetHeaders,
    AppendChildNode,
    NewRequest,
    HeadersRequest,
    InstanceofResponse,
    JsonResponse,
    InstanceofWindow,
    DocumentWindow,
    FetchWithRequestWindow,
    NewNoArgsFunction,
    CallFunction,
    CallFunction1,
    NewObject,
    SetReflect,
    NewPromise,
    ThenPromise,
}

impl Import {
    /// Identifies an import by name. Imports named after a generated binding (`__wbg_<op>_...`)
    /// carry an unstable suffix, so those are told apart by operation and parameter count.
    pub fn resolve(name: &str, params: usize) -> Option<Self> {
        let exact = match name {
            "__wbindgen_object_clone_ref" => Self::ObjectCloneRef,
            "__wbindgen_object_drop_ref" => Self::ObjectDropRef,
            "__wbindgen_string_new" => Self::StringNew,
            "__wbindgen_number_get" => Self::NumberGet,
            "__wbindgen_is_null" => Self::IsNull,
            "__wbindgen_is_undefined" => Self::IsUndefined,
            "__wbindgen_boolean_get" => Self::BooleanGet,
            "__wbindgen_is_symbol" => Self::IsSymbol,
            "__wbindgen_string_get" => Self::StringGet,
            "__wbindgen_cb_drop" => Self::CbDrop,
            "__wbindgen_json_serialize" => Self::JsonSerialize,
            "__wbindgen_throw" => Self::Throw,
            "__widl_f_create_element_Document" => Self::CreateElementDocument,
            "__widl_f_body_Document" => Self::BodyDocument,
            "__widl_f_set_inner_html_Element" => Self::SetInnerHtmlElement,
            "__widl_f_set_Headers" => Self::SetHeaders,
            "__widl_f_append_child_Node" => Self::AppendChildNode,
            "__widl_f_new_with_str_and_init_Request" => Self::NewRequest,
            "__widl_f_headers_Request" => Self::HeadersRequest,
            "__widl_instanceof_Response" => Self::InstanceofResponse,
            "__widl_f_json_Response" => Self::JsonResponse,
            "__widl_instanceof_Window" => Self::InstanceofWindow,
            "__widl_f_document_Window" => Self::DocumentWindow,
            "__widl_f_fetch_with_request_Window" => Self::FetchWithRequestWindow,
            _ => return Self::resolve_generated(name, params),
        };

        Some(exact)
    }

    fn resolve_generated(name: &str, params: usize) -> Option<Self> {
        if name.starts_with("__wbindgen_closure_wrapper") {
            return Some(Self::ClosureWrapper);
        }

        let rest = name.strip_prefix("__wbg_")?;
        let (op, _) = rest.split_once('_')?;

        Some(match (op, params) {
            ("newnoargs", 2) => Self::NewNoArgsFunction,
            ("call", 3) => Self::CallFunction,
            ("call", 4) => Self::CallFunction1,
            ("new", 0) => Self::NewObject,
            ("new", 1) => Self::NewPromise,
            ("set", 4) => Self::SetReflect,
            ("then", 3) => Self::ThenPromise,
            _ => return None,
        })
    }

    /// The host capability this import reaches, if any.
    pub fn capability(self) -> Option<CapabilityId> {
        Some(match self {
            Self::CreateElementDocument => CapabilityId::CreateElement,
            Self::BodyDocument => CapabilityId::DocumentBody,
            Self::SetInnerHtmlElement => CapabilityId::SetInnerHtml,
            Self::SetHeaders => CapabilityId::HeadersSet,
            Self::AppendChildNode => CapabilityId::AppendChild,
            Self::NewRequest => CapabilityId::RequestConstructor,
            Self::HeadersRequest => CapabilityId::RequestHeaders,
            Self::JsonResponse => CapabilityId::ResponseJson,
            Self::DocumentWindow => CapabilityId::WindowDocument,
            Self::FetchWithRequestWindow => CapabilityId::WindowFetch,
            Self::NewNoArgsFunction => CapabilityId::FunctionConstructor,
            Self::CallFunction | Self::CallFunction1 => CapabilityId::FunctionCall,
            Self::NewObject => CapabilityId::ObjectConstructor,
            Self::SetReflect => CapabilityId::ReflectSet,
            Self::NewPromise => CapabilityId::PromiseConstructor,
            Self::ThenPromise => CapabilityId::PromiseThen,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedImport {
    pub name: String,
    pub import: Import,
}

/// Resolves every function `module` imports from `import_module`.
pub fn resolve_imports(
    module: &wasmtime::Module,
    import_module: &str,
) -> anyhow::Result<Vec<ResolvedImport>> {
    module
        .imports()
        .filter(|import| import.module() == import_module)
        .map(|import| {
            let name = import.name();

            let ExternType::Func(func) = import.ty() else {
                anyhow::bail!("import `{import_module}::{name}` is not a function");
            };

            let resolved = Import::resolve(name, func.params().len())
                .with_context(|| format!("guest requests unknown import `{import_module}::{name}`"))?;

            Ok(ResolvedImport {
                name: name.to_string(),
                import: resolved,
            })
        })
        .collect()
}

// === Linking === //

macro_rules! wrap {
    ($linker:expr, $module:expr, $name:expr, $shim:path $(, $arg:ident)*) => {
        $linker.func_wrap(
            $module,
            $name,
            |caller: Caller<'_, HostState>, $($arg: u32),*| enter(caller, |cx| $shim(cx $(, $arg)*)),
        )
    };
}

/// Defines `import` on `linker` under `module`.
pub fn define(
    linker: &mut HostLinker,
    module: &str,
    import: &ResolvedImport,
) -> anyhow::Result<()> {
    let name = import.name.as_str();

    match import.import {
        Import::ObjectCloneRef => wrap!(linker, module, name, shims::object_clone_ref, idx),
        Import::ObjectDropRef => wrap!(linker, module, name, shims::object_drop_ref, idx),
        Import::StringNew => wrap!(linker, module, name, shims::string_new, ptr, len),
        Import::NumberGet => wrap!(linker, module, name, shims::number_get, idx, invalid),
        Import::IsNull => wrap!(linker, module, name, shims::is_null, idx),
        Import::IsUndefined => wrap!(linker, module, name, shims::is_undefined, idx),
        Import::BooleanGet => wrap!(linker, module, name, shims::boolean_get, idx),
        Import::IsSymbol => wrap!(linker, module, name, shims::is_symbol, idx),
        Import::StringGet => wrap!(linker, module, name, shims::string_get, idx, len_ptr),
        Import::CbDrop => wrap!(linker, module, name, shims::cb_drop, idx),
        Import::JsonSerialize => wrap!(linker, module, name, shims::json_serialize, idx, ptrptr),
        Import::ClosureWrapper => linker.func_wrap(
            module,
            name,
            |caller: Caller<'_, HostState>, a: u32, b: u32, func: u32, dtor: u32, _: u32| {
                enter(caller, |cx| shims::closure_wrapper(cx, a, b, func, dtor))
            },
        ),
        Import::Throw => wrap!(linker, module, name, shims::throw, ptr, len),
        Import::CreateElementDocument => wrap!(
            linker,
            module,
            name,
            shims::create_element_document,
            this,
            ptr,
            len,
            exn
        ),
        Import::BodyDocument => wrap!(linker, module, name, shims::body_document, this),
        Import::SetInnerHtmlElement => wrap!(
            linker,
            module,
            name,
            shims::set_inner_html_element,
            this,
            ptr,
            len
        ),
        Import::SetHeaders => wrap!(
            linker,
            module,
            name,
            shims::set_headers,
            this,
            name_ptr,
            name_len,
            value_ptr,
            value_len,
            exn
        ),
        Import::AppendChildNode => {
            wrap!(linker, module, name, shims::append_child_node, this, child, exn)
        }
        Import::NewRequest => wrap!(
            linker,
            module,
            name,
            shims::new_request,
            url_ptr,
            url_len,
            init,
            exn
        ),
        Import::HeadersRequest => wrap!(linker, module, name, shims::headers_request, this),
        Import::InstanceofResponse => {
            wrap!(linker, module, name, shims::instanceof_response, idx)
        }
        Import::JsonResponse => wrap!(linker, module, name, shims::json_response, this, exn),
        Import::InstanceofWindow => wrap!(linker, module, name, shims::instanceof_window, idx),
        Import::DocumentWindow => wrap!(linker, module, name, shims::document_window, this),
        Import::FetchWithRequestWindow => wrap!(
            linker,
            module,
            name,
            shims::fetch_with_request_window,
            this,
            request
        ),
        Import::NewNoArgsFunction => {
            wrap!(linker, module, name, shims::newnoargs_function, ptr, len)
        }
        Import::CallFunction => {
            wrap!(linker, module, name, shims::call_function, func, this_arg, exn)
        }
        Import::CallFunction1 => wrap!(
            linker,
            module,
            name,
            shims::call_function_1,
            func,
            this_arg,
            arg,
            exn
        ),
        Import::NewObject => wrap!(linker, module, name, shims::new_object),
        Import::SetReflect => wrap!(
            linker,
            module,
            name,
            shims::set_reflect,
            target,
            key,
            value,
            exn
        ),
        Import::NewPromise => wrap!(linker, module, name, shims::new_promise, func),
        Import::ThenPromise => wrap!(
            linker,
            module,
            name,
            shims::then_promise,
            this,
            on_fulfilled,
            on_rejected
        ),
    }?;

    Ok(())
}
