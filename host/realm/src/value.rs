use std::{
    cell::{Ref, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use tether::{ClosureRecord, HandleValue};

use crate::{
    call::NativeMethod,
    realm::{
        dom::{Document, Element, Window},
        net::{Headers, Request, Response},
        promise::{PromiseCell, Resolver},
        reflect::Script,
    },
};

// === HostValue === //

/// A value living on the host side of the boundary.
#[derive(Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Symbol(Symbol),
    Object(Obj),
}

impl HandleValue for HostValue {
    fn undefined() -> Self {
        Self::Undefined
    }

    fn null() -> Self {
        Self::Null
    }

    fn boolean(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl HostValue {
    pub fn string(text: impl Into<Rc<str>>) -> Self {
        Self::String(text.into())
    }

    pub fn error(name: &str, message: impl Into<Rc<str>>) -> Self {
        Self::Object(Obj::new(ObjectKind::Error(ErrorData {
            name: name.into(),
            message: message.into(),
        })))
    }

    pub fn type_error(message: impl Into<Rc<str>>) -> Self {
        Self::error("TypeError", message)
    }

    pub fn syntax_error(message: impl Into<Rc<str>>) -> Self {
        Self::error("SyntaxError", message)
    }

    pub fn as_object(&self) -> Option<&Obj> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn is_callable(&self) -> bool {
        self.as_object()
            .is_some_and(|obj| matches!(obj.kind(), ObjectKind::Function(_)))
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "object",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Object(obj) if matches!(obj.kind(), ObjectKind::Function(_)) => "function",
            Self::Object(_) => "object",
        }
    }

    /// Converts the value to text the way string coercion does for primitives.
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(value) => value.to_string(),
            Self::Number(value) => number_to_string(*value),
            Self::String(text) => text.to_string(),
            Self::Symbol(symbol) => format!("Symbol({})", symbol.description()),
            Self::Object(obj) => match obj.kind() {
                ObjectKind::Error(error) if error.message.is_empty() => error.name.to_string(),
                ObjectKind::Error(error) => format!("{}: {}", error.name, error.message),
                _ => format!("[object {}]", obj.class_name()),
            },
        }
    }

    pub fn to_property_key(&self) -> PropertyKey {
        match self {
            Self::Symbol(symbol) => PropertyKey::Symbol(symbol.clone()),
            Self::String(text) => PropertyKey::String(text.clone()),
            other => PropertyKey::String(other.to_display_string().into()),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Number(value) => f.write_str(&number_to_string(*value)),
            Self::String(text) => write!(f, "{text:?}"),
            Self::Symbol(symbol) => symbol.fmt(f),
            Self::Object(obj) => obj.fmt(f),
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<Obj> for HostValue {
    fn from(value: Obj) -> Self {
        Self::Object(value)
    }
}

pub fn number_to_string(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        let text = if value > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if value.fract() == 0.0 && value.abs() < 9.007_199_254_740_992e15 {
        // Also folds `-0` into `0`.
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

// === Symbol === //

/// A unique symbol. Two symbols are equal only if they come from the same creation.
#[derive(Clone)]
pub struct Symbol(Rc<str>);

impl Symbol {
    pub fn new(description: impl Into<Rc<str>>) -> Self {
        Self(description.into())
    }

    pub fn description(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKey {
    String(Rc<str>),
    Symbol(Symbol),
}

impl PropertyKey {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            Self::Symbol(_) => None,
        }
    }

    /// The array index named by this key, if it is one.
    pub fn as_index(&self) -> Option<usize> {
        let text = self.as_str()?;

        if text != "0" && text.starts_with('0') {
            return None;
        }

        text.parse().ok()
    }
}

impl From<&str> for PropertyKey {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

// === Obj === //

/// A reference to a host object. Equality is identity.
#[derive(Clone)]
pub struct Obj(Rc<ObjData>);

struct ObjData {
    kind: ObjectKind,
    props: RefCell<Vec<(PropertyKey, HostValue)>>,
}

pub enum ObjectKind {
    Plain,
    Array(RefCell<Vec<HostValue>>),
    Error(ErrorData),
    Function(HostFunction),
    Window(Window),
    Document(Document),
    Element(Element),
    Headers(Headers),
    Request(Request),
    Response(Response),
    Promise(PromiseCell),
}

#[derive(Debug, Clone)]
pub struct ErrorData {
    pub name: Rc<str>,
    pub message: Rc<str>,
}

pub enum HostFunction {
    Native {
        name: &'static str,
        method: NativeMethod,
    },
    Resolver(Resolver),
    Guest(Rc<ClosureRecord>),
    Script(Script),
}

impl Obj {
    pub fn new(kind: ObjectKind) -> Self {
        Self(Rc::new(ObjData {
            kind,
            props: RefCell::default(),
        }))
    }

    pub fn plain() -> Self {
        Self::new(ObjectKind::Plain)
    }

    pub fn array(items: Vec<HostValue>) -> Self {
        Self::new(ObjectKind::Array(RefCell::new(items)))
    }

    pub fn function(function: HostFunction) -> Self {
        Self::new(ObjectKind::Function(function))
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.0.kind
    }

    pub fn class_name(&self) -> &'static str {
        match self.kind() {
            ObjectKind::Plain => "Object",
            ObjectKind::Array(_) => "Array",
            ObjectKind::Error(_) => "Error",
            ObjectKind::Function(_) => "Function",
            ObjectKind::Window(_) => "Window",
            ObjectKind::Document(_) => "HTMLDocument",
            ObjectKind::Element(_) => "HTMLElement",
            ObjectKind::Headers(_) => "Headers",
            ObjectKind::Request(_) => "Request",
            ObjectKind::Response(_) => "Response",
            ObjectKind::Promise(_) => "Promise",
        }
    }

    pub fn get(&self, key: &PropertyKey) -> Option<HostValue> {
        if let (ObjectKind::Array(items), Some(index)) = (self.kind(), key.as_index()) {
            return items.borrow().get(index).cloned();
        }

        self.0
            .props
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn get_str(&self, key: &str) -> Option<HostValue> {
        self.get(&PropertyKey::from(key))
    }

    pub fn set(&self, key: PropertyKey, value: HostValue) {
        if let (ObjectKind::Array(items), Some(index)) = (self.kind(), key.as_index()) {
            let mut items = items.borrow_mut();
            if index >= items.len() {
                items.resize(index + 1, HostValue::Undefined);
            }
            items[index] = value;
            return;
        }

        let mut props = self.0.props.borrow_mut();

        match props.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => props.push((key, value)),
        }
    }

    /// Own properties in insertion order.
    pub fn props(&self) -> Ref<'_, Vec<(PropertyKey, HostValue)>> {
        self.0.props.borrow()
    }

    /// An address identifying this object for as long as it is alive.
    pub fn as_ptr(&self) -> *const () {
        Rc::as_ptr(&self.0).cast()
    }

    pub fn downgrade(&self) -> WeakObj {
        WeakObj(Rc::downgrade(&self.0))
    }
}

impl PartialEq for Obj {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ObjectKind::Error(error) => write!(f, "{}({:?})", error.name, error.message),
            ObjectKind::Function(HostFunction::Native { name, .. }) => {
                write!(f, "[Function {name}]")
            }
            ObjectKind::Element(element) => write!(f, "<{}>", element.tag_name()),
            _ => write!(f, "[object {}]", self.class_name()),
        }
    }
}

#[derive(Clone)]
pub struct WeakObj(Weak<ObjData>);

impl WeakObj {
    pub fn upgrade(&self) -> Option<Obj> {
        self.0.upgrade().map(Obj)
    }
}

impl fmt::Debug for WeakObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakObj").finish_non_exhaustive()
    }
}
