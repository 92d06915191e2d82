//! The host capabilities a guest may bind against, and the per-instance table of those it did.

use std::fmt;

use thiserror::Error;

use crate::{
    call::NativeMethod,
    realm::{dom, net, promise, reflect},
};

// === CapabilityId === //

macro_rules! capabilities {
    ($($variant:ident => $name:literal, $method:path;)*) => {
        #[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
        pub enum CapabilityId {
            $($variant,)*
        }

        impl CapabilityId {
            pub const ALL: &[Self] = &[$(Self::$variant,)*];

            /// The name of the host API this capability stands for.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            /// The realm's own implementation of this capability.
            pub fn intrinsic(self) -> NativeMethod {
                match self {
                    $(Self::$variant => $method,)*
                }
            }
        }
    };
}

capabilities! {
    CreateElement => "Document.prototype.createElement", dom::create_element;
    DocumentBody => "Document.prototype.body", dom::document_body;
    SetInnerHtml => "Element.prototype.innerHTML", dom::set_inner_html;
    HeadersSet => "Headers.prototype.set", net::headers_set;
    AppendChild => "Node.prototype.appendChild", dom::append_child;
    RequestConstructor => "Request", net::request_constructor;
    RequestHeaders => "Request.prototype.headers", net::request_headers;
    ResponseJson => "Response.prototype.json", net::response_json;
    WindowDocument => "Window.prototype.document", dom::window_document;
    WindowFetch => "Window.prototype.fetch", net::window_fetch;
    FunctionConstructor => "Function", reflect::function_constructor;
    FunctionCall => "Function.prototype.call", reflect::function_call;
    ObjectConstructor => "Object", reflect::object_constructor;
    ReflectSet => "Reflect.set", reflect::reflect_set;
    PromiseConstructor => "Promise", promise::promise_constructor;
    PromiseThen => "Promise.prototype.then", promise::promise_then;
}

impl CapabilityId {
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.name() == name)
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// === Descriptors === //

#[derive(Copy, Clone)]
pub enum Capability {
    Available(NativeMethod),
    Missing,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available(_) => f.write_str("Available"),
            Self::Missing => f.write_str("Missing"),
        }
    }
}

/// What the host environment offers, before any guest has bound against it.
#[derive(Debug, Clone)]
pub struct CapabilityDescriptors {
    entries: Vec<Capability>,
}

impl CapabilityDescriptors {
    /// Every capability, implemented by the realm itself.
    pub fn intrinsic() -> Self {
        Self {
            entries: CapabilityId::ALL
                .iter()
                .map(|id| Capability::Available(id.intrinsic()))
                .collect(),
        }
    }

    pub fn disable(&mut self, id: CapabilityId) {
        self.entries[id as usize] = Capability::Missing;
    }

    pub fn provide(&mut self, id: CapabilityId, method: NativeMethod) {
        self.entries[id as usize] = Capability::Available(method);
    }

    pub fn get(&self, id: CapabilityId) -> Capability {
        self.entries[id as usize]
    }
}

#[derive(Debug, Clone, Error)]
#[error("host does not provide `{capability}`, required by import `{import}`")]
pub struct CapabilityMissing {
    pub capability: CapabilityId,
    pub import: String,
}

// === CapabilityTable === //

/// The capabilities bound for one guest instance. Binding happens once, before the guest runs.
#[derive(Clone)]
pub struct CapabilityTable {
    bound: Vec<Option<NativeMethod>>,
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(
                CapabilityId::ALL
                    .iter()
                    .filter(|id| self.is_bound(**id))
                    .map(|id| id.name()),
            )
            .finish()
    }
}

impl CapabilityTable {
    /// Binds each `(capability, import)` pair against `descriptors`, failing on the first
    /// capability the host lacks.
    pub fn bind<'a>(
        descriptors: &CapabilityDescriptors,
        required: impl IntoIterator<Item = (CapabilityId, &'a str)>,
    ) -> Result<Self, CapabilityMissing> {
        let mut bound = vec![None; CapabilityId::ALL.len()];

        for (id, import) in required {
            match descriptors.get(id) {
                Capability::Available(method) => {
                    tracing::debug!(capability = id.name(), import, "bound capability");
                    bound[id as usize] = Some(method);
                }
                Capability::Missing => {
                    return Err(CapabilityMissing {
                        capability: id,
                        import: import.to_string(),
                    });
                }
            }
        }

        Ok(Self { bound })
    }

    /// Every intrinsic capability, bound.
    pub fn full() -> Self {
        Self {
            bound: CapabilityId::ALL
                .iter()
                .map(|id| Some(id.intrinsic()))
                .collect(),
        }
    }

    pub fn is_bound(&self, id: CapabilityId) -> bool {
        self.bound[id as usize].is_some()
    }

    pub fn method(&self, id: CapabilityId) -> anyhow::Result<NativeMethod> {
        self.bound[id as usize]
            .ok_or_else(|| anyhow::anyhow!("capability `{id}` was never bound for this guest"))
    }
}
