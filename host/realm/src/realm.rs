use std::{collections::VecDeque, fmt};

use crate::{
    call::Completion,
    capability::CapabilityTable,
    value::{HostValue, Obj, ObjectKind},
};

pub mod dom;
pub mod net;
pub mod promise;
pub mod reflect;

use self::{
    dom::{Document, Element, Window},
    net::{FetchBackend, FetchRequest, StaticFetch},
    promise::Reaction,
};

// === Realm === //

/// The host environment a guest talks to: the global window, its document, the job queue, and
/// the capabilities bound for this instance.
pub struct Realm {
    global: Obj,
    document: Obj,
    jobs: VecDeque<Job>,
    fetch: Box<dyn FetchBackend>,
    capabilities: CapabilityTable,
}

/// Deferred work settled outside of the call that scheduled it.
#[derive(Debug)]
pub enum Job {
    Reaction { reaction: Reaction, outcome: Completion },
    Adopt { target: Obj, source: Obj },
    Fetch { promise: Obj, request: FetchRequest },
    ParseJson { promise: Obj, body: String },
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("pending_jobs", &self.jobs.len())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Default for Realm {
    fn default() -> Self {
        Self::new(StaticFetch::default())
    }
}

impl Realm {
    /// A realm with every capability bound.
    pub fn new(fetch: impl FetchBackend + 'static) -> Self {
        Self::with_capabilities(fetch, CapabilityTable::full())
    }

    pub fn with_capabilities(
        fetch: impl FetchBackend + 'static,
        capabilities: CapabilityTable,
    ) -> Self {
        let body = Obj::new(ObjectKind::Element(Element::new("body")));
        let document = Obj::new(ObjectKind::Document(Document::new(body)));
        let global = Obj::new(ObjectKind::Window(Window::new(document.clone())));

        Self {
            global,
            document,
            jobs: VecDeque::new(),
            fetch: Box::new(fetch),
            capabilities,
        }
    }

    pub fn global(&self) -> &Obj {
        &self.global
    }

    pub fn document(&self) -> &Obj {
        &self.document
    }

    pub fn body(&self) -> Option<Obj> {
        match self.document().kind() {
            ObjectKind::Document(document) => document.body(),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn fetch_backend(&self) -> &dyn FetchBackend {
        &*self.fetch
    }

    pub fn enqueue(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub fn next_job(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Serializes the document body as markup.
    pub fn render_body(&self) -> String {
        let mut out = String::new();

        if let Some(body) = self.body() {
            dom::render(&body, &mut out);
        }

        out
    }

    pub fn global_value(&self) -> HostValue {
        HostValue::Object(self.global.clone())
    }
}
