use std::{cell::RefCell, fmt, rc::Rc};

use crate::{
    call::{Completion, Scope},
    value::{HostValue, Obj, ObjectKind, WeakObj},
};

// === Nodes === //

pub struct Window {
    document: Obj,
}

impl Window {
    pub fn new(document: Obj) -> Self {
        Self { document }
    }

    pub fn document(&self) -> &Obj {
        &self.document
    }
}

pub struct Document {
    body: Option<Obj>,
}

impl Document {
    pub fn new(body: Obj) -> Self {
        Self { body: Some(body) }
    }

    pub fn body(&self) -> Option<Obj> {
        self.body.clone()
    }
}

pub struct Element {
    tag: Rc<str>,
    inner_html: RefCell<String>,
    children: RefCell<Vec<Obj>>,
    parent: RefCell<Option<WeakObj>>,
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("tag", &self.tag)
            .field("children", &self.children.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase().into(),
            inner_html: RefCell::default(),
            children: RefCell::default(),
            parent: RefCell::default(),
        }
    }

    pub fn tag_name(&self) -> &str {
        &self.tag
    }

    pub fn inner_html(&self) -> String {
        self.inner_html.borrow().clone()
    }

    pub fn children(&self) -> Vec<Obj> {
        self.children.borrow().clone()
    }

    pub fn parent(&self) -> Option<Obj> {
        self.parent.borrow().as_ref()?.upgrade()
    }

    fn set_inner_html(&self, markup: String) {
        for child in self.children.take() {
            if let ObjectKind::Element(child) = child.kind() {
                child.parent.take();
            }
        }

        *self.inner_html.borrow_mut() = markup;
    }
}

fn as_element(value: &HostValue) -> Option<(&Obj, &Element)> {
    let obj = value.as_object()?;

    match obj.kind() {
        ObjectKind::Element(element) => Some((obj, element)),
        _ => None,
    }
}

/// Whether `name` is acceptable as an element name.
pub fn is_valid_tag_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };

    (first.is_ascii_alphabetic() || first == '_' || first == ':' || !first.is_ascii())
        && chars.all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':') || !c.is_ascii()
        })
}

pub fn render(node: &Obj, out: &mut String) {
    let ObjectKind::Element(element) = node.kind() else {
        return;
    };

    out.push('<');
    out.push_str(&element.tag);
    out.push('>');
    out.push_str(&element.inner_html.borrow());

    for child in element.children.borrow().iter() {
        render(child, out);
    }

    out.push_str("</");
    out.push_str(&element.tag);
    out.push('>');
}

fn illegal_invocation() -> anyhow::Result<Completion> {
    Ok(Err(HostValue::type_error("Illegal invocation")))
}

// === Capabilities === //

pub fn create_element(
    _scope: &mut dyn Scope,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    if !matches!(this.as_object().map(Obj::kind), Some(ObjectKind::Document(_))) {
        return illegal_invocation();
    }

    let tag = args
        .first()
        .map(HostValue::to_display_string)
        .unwrap_or_default();

    if !is_valid_tag_name(&tag) {
        return Ok(Err(HostValue::error(
            "InvalidCharacterError",
            format!("The tag name provided ('{tag}') is not a valid name."),
        )));
    }

    Ok(Ok(Obj::new(ObjectKind::Element(Element::new(&tag))).into()))
}

pub fn document_body(
    _scope: &mut dyn Scope,
    this: &HostValue,
    _args: &[HostValue],
) -> anyhow::Result<Completion> {
    match this.as_object().map(Obj::kind) {
        Some(ObjectKind::Document(document)) => {
            Ok(Ok(document.body().map_or(HostValue::Null, HostValue::Object)))
        }
        _ => illegal_invocation(),
    }
}

pub fn set_inner_html(
    _scope: &mut dyn Scope,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let Some((_, element)) = as_element(this) else {
        return illegal_invocation();
    };

    let markup = match args.first() {
        None | Some(HostValue::Null) => String::new(),
        Some(value) => value.to_display_string(),
    };

    element.set_inner_html(markup);
    Ok(Ok(HostValue::Undefined))
}

pub fn append_child(
    _scope: &mut dyn Scope,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let Some((parent_obj, parent)) = as_element(this) else {
        return illegal_invocation();
    };

    let child_value = args.first().cloned().unwrap_or(HostValue::Undefined);
    let Some((child_obj, child)) = as_element(&child_value) else {
        return Ok(Err(HostValue::type_error(
            "Failed to execute 'appendChild' on 'Node': parameter 1 is not of type 'Node'.",
        )));
    };

    // The child may not be the parent or one of its ancestors.
    let mut cursor = Some(parent_obj.clone());
    while let Some(node) = cursor {
        if node == *child_obj {
            return Ok(Err(HostValue::error(
                "HierarchyRequestError",
                "The new child element contains the parent.",
            )));
        }

        cursor = match node.kind() {
            ObjectKind::Element(element) => element.parent(),
            _ => None,
        };
    }

    if let Some(old_parent) = child.parent() {
        if let ObjectKind::Element(old_parent) = old_parent.kind() {
            old_parent.children.borrow_mut().retain(|node| node != child_obj);
        }
    }

    parent.children.borrow_mut().push(child_obj.clone());
    *child.parent.borrow_mut() = Some(parent_obj.downgrade());

    Ok(Ok(child_value.clone()))
}

pub fn window_document(
    _scope: &mut dyn Scope,
    this: &HostValue,
    _args: &[HostValue],
) -> anyhow::Result<Completion> {
    match this.as_object().map(Obj::kind) {
        Some(ObjectKind::Window(window)) => Ok(Ok(window.document().clone().into())),
        _ => illegal_invocation(),
    }
}

#[cfg(test)]
mod tests {
    use tether::{GuestContext as _, sandbox::Sandbox};

    use super::*;
    use crate::realm::Realm;

    fn element(sb: &mut Sandbox<HostValue, Realm>, tag: &str) -> HostValue {
        let document = HostValue::Object(sb.host().document().clone());
        create_element(sb, &document, &[tag.into()]).unwrap().unwrap()
    }

    #[test]
    fn tag_names_are_validated() {
        assert!(is_valid_tag_name("div"));
        assert!(is_valid_tag_name("my-widget"));
        assert!(!is_valid_tag_name(""));
        assert!(!is_valid_tag_name("1bad"));
        assert!(!is_valid_tag_name("a b"));
    }

    #[test]
    fn invalid_tag_throws_dom_exception() {
        let mut sb = Sandbox::<HostValue, Realm>::new(Realm::default());
        let document = HostValue::Object(sb.host().document().clone());

        let thrown = create_element(&mut sb, &document, &["<p>".into()])
            .unwrap()
            .unwrap_err();

        assert!(thrown.to_display_string().starts_with("InvalidCharacterError"));
    }

    #[test]
    fn append_child_moves_nodes_and_rejects_cycles() {
        let mut sb = Sandbox::<HostValue, Realm>::new(Realm::default());
        let outer = element(&mut sb, "DIV");
        let inner = element(&mut sb, "span");
        let body = HostValue::Object(sb.host().body().unwrap());

        append_child(&mut sb, &outer, &[inner.clone()]).unwrap().unwrap();
        append_child(&mut sb, &body, &[outer.clone()]).unwrap().unwrap();
        assert_eq!(sb.host().render_body(), "<body><div><span></span></div></body>");

        let thrown = append_child(&mut sb, &inner, &[outer.clone()]).unwrap().unwrap_err();
        assert!(thrown.to_display_string().starts_with("HierarchyRequestError"));

        // Re-parenting detaches from the old parent.
        append_child(&mut sb, &body, &[inner.clone()]).unwrap().unwrap();
        assert_eq!(
            sb.host().render_body(),
            "<body><div></div><span></span></body>"
        );
    }

    #[test]
    fn inner_html_replaces_children() {
        let mut sb = Sandbox::<HostValue, Realm>::new(Realm::default());
        let div = element(&mut sb, "div");
        let span = element(&mut sb, "span");

        append_child(&mut sb, &div, &[span]).unwrap().unwrap();
        set_inner_html(&mut sb, &div, &["hi".into()]).unwrap().unwrap();

        let (_, div) = as_element(&div).unwrap();
        assert_eq!(div.inner_html(), "hi");
        assert!(div.children().is_empty());
    }
}
