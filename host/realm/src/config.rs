use std::{fs, io, path::Path};

use serde::Deserialize;
use tether_wasmtime::ExportNames;
use thiserror::Error;

use crate::{
    capability::{CapabilityDescriptors, CapabilityId},
    realm::net::{FetchResponse, StaticFetch, StaticRoute},
};

// === RuntimeConfig === //

/// How a guest is hosted.
///
/// ```toml
/// import_module = "./hud"
/// disabled_capabilities = ["Window.prototype.fetch"]
/// job_limit = 1000
///
/// [exports]
/// entry = "run"
///
/// [[fetch.routes]]
/// url = "/sensors"
/// body = '[{ "name": "temp", "value": 21.5 }]'
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// The module name the guest imports its host functions from.
    pub import_module: String,
    pub exports: ExportConfig,
    /// Host APIs to withhold, by name (e.g. `Reflect.set`). A guest importing one fails to bind.
    pub disabled_capabilities: Vec<String>,
    pub fetch: FetchConfig,
    /// How many queued jobs may run after the entry point returns before the run is abandoned.
    pub job_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            import_module: "./hud".to_string(),
            exports: ExportConfig::default(),
            disabled_capabilities: Vec::new(),
            fetch: FetchConfig::default(),
            job_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub entry: String,
    pub memory: String,
    pub alloc: String,
    pub table: String,
    pub global_argument_ptr: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        let names = ExportNames::default();

        Self {
            entry: "run".to_string(),
            memory: names.memory,
            alloc: names.alloc,
            table: names.table,
            global_argument_ptr: names.global_argument_ptr,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub url: String,
    #[serde(default = "RouteConfig::default_status")]
    pub status: u16,
    #[serde(default)]
    pub body: String,
    /// Fail the request as if the network were down.
    #[serde(default)]
    pub unreachable: bool,
}

impl RouteConfig {
    fn default_status() -> u16 {
        200
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] io::Error),
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    #[error("unknown capability `{0}`")]
    UnknownCapability(String),
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn disabled(&self) -> Result<Vec<CapabilityId>, ConfigError> {
        self.disabled_capabilities
            .iter()
            .map(|name| {
                CapabilityId::from_name(name)
                    .ok_or_else(|| ConfigError::UnknownCapability(name.clone()))
            })
            .collect()
    }

    /// What the host offers once disabled capabilities are withheld.
    pub fn descriptors(&self) -> Result<CapabilityDescriptors, ConfigError> {
        let mut descriptors = CapabilityDescriptors::intrinsic();

        for id in self.disabled()? {
            descriptors.disable(id);
        }

        Ok(descriptors)
    }

    pub fn export_names(&self) -> ExportNames {
        ExportNames {
            memory: self.exports.memory.clone(),
            alloc: self.exports.alloc.clone(),
            table: self.exports.table.clone(),
            global_argument_ptr: self.exports.global_argument_ptr.clone(),
        }
    }

    pub fn fetch_backend(&self) -> StaticFetch {
        let mut backend = StaticFetch::default();

        for route in &self.fetch.routes {
            let target = if route.unreachable {
                StaticRoute::Unreachable
            } else {
                StaticRoute::Respond(FetchResponse {
                    status: route.status,
                    body: route.body.clone(),
                })
            };

            backend.insert(route.url.clone(), target);
        }

        backend
    }
}

#[cfg(test)]
mod tests {
    use crate::realm::net::{FetchBackend as _, FetchRequest};

    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();

        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.export_names(), ExportNames::default());
        assert_eq!(config.exports.entry, "run");
    }

    #[test]
    fn routes_and_capabilities_parse() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            import_module = "env"
            disabled_capabilities = ["Reflect.set"]

            [exports]
            table = "__wbg_function_table"

            [[fetch.routes]]
            url = "/sensors"
            body = "[]"

            [[fetch.routes]]
            url = "/offline"
            unreachable = true
            "#,
        )
        .unwrap();

        assert_eq!(config.import_module, "env");
        assert_eq!(config.export_names().table, "__wbg_function_table");
        assert_eq!(config.disabled().unwrap(), vec![CapabilityId::ReflectSet]);

        let backend = config.fetch_backend();
        let request = |url: &str| FetchRequest {
            url: url.to_string(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
        };

        assert_eq!(backend.fetch(&request("/sensors")).unwrap().status, 200);
        assert!(backend.fetch(&request("/offline")).is_err());
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let config = RuntimeConfig::from_toml_str(r#"disabled_capabilities = ["Document.write"]"#)
            .unwrap();

        assert!(matches!(
            config.descriptors(),
            Err(ConfigError::UnknownCapability(name)) if name == "Document.write"
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("entry = \"main\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
