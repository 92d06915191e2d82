pub mod bindings;
pub mod call;
pub mod capability;
pub mod config;
pub mod json;
pub mod realm;
pub mod runtime;
pub mod shims;
pub mod value;
