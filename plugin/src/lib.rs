//! Plugin lifecycle surface: metadata, schemas, rule CRUD and connectivity check.
//!
//! # Design
//! Everything the host calls is a plain function over strings so it can be
//! exercised natively. The wasm32 build wraps the same functions in the
//! exported WIT world (see `component`); native builds run `ping` over the
//! thread-backed substrate, which is what the integration tests use.

use std::time::Duration;

use myplugin_core::{send, Request, Substrate};
use serde::Deserialize;
use tracing::debug;

const SETTINGS: &str = include_str!("../package/settings.k");
const RULE_SCHEMA: &str = include_str!("../package/rule.k");

/// Endpoint probed by `ping` when the configuration names none.
pub const DEFAULT_ENDPOINT: &str = "https://google.fr";

/// Plugin identity reported to the host on install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
}

/// Connection settings, parsed from the JSON string the host passes in.
///
/// Unknown fields are ignored. An empty string means all defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    pub endpoint: Option<String>,
    /// Connect timeout in seconds.
    pub timeout: Option<u64>,
}

impl Config {
    pub fn parse(config: &str) -> Result<Self, String> {
        if config.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(config).map_err(|e| format!("unable to parse configuration: {e}"))
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

pub fn load() -> Metadata {
    Metadata {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        author: env!("CARGO_PKG_AUTHORS").to_string(),
        description: env!("CARGO_PKG_DESCRIPTION").to_string(),
    }
}

/// KCL schema of the plugin settings.
pub fn settings() -> String {
    SETTINGS.to_string()
}

/// KCL schema of a detection rule.
pub fn schema() -> String {
    RULE_SCHEMA.to_string()
}

pub fn create(_config: &str, _name: &str, _params: &str) -> Result<Option<String>, String> {
    Ok(Some("create()".to_string()))
}

pub fn read(_config: &str, _name: &str, _params: &str) -> Result<Option<String>, String> {
    Ok(Some("read()".to_string()))
}

pub fn update(_config: &str, _name: &str, _params: &str) -> Result<Option<String>, String> {
    Ok(Some("update()".to_string()))
}

pub fn delete(_config: &str, _name: &str, _params: &str) -> Result<Option<String>, String> {
    Ok(Some("delete()".to_string()))
}

/// GET the configured endpoint and report its status.
///
/// Statuses of 400 and above fail with the code as text; adapter failures
/// fail with the error message.
pub fn ping_with<S, F>(config: &str, connect: F) -> Result<u16, String>
where
    S: Substrate,
    F: FnOnce(&Config) -> S,
{
    let config = Config::parse(config)?;
    let substrate = connect(&config);

    let response = send(&substrate, &Request::get(config.endpoint())).map_err(|e| e.to_string())?;
    debug!(endpoint = config.endpoint(), status = response.status, "ping");
    if !response.is_success() {
        return Err(response.status.to_string());
    }
    Ok(response.status)
}

/// `ping_with` over the substrate of the current target.
pub fn ping(config: &str) -> Result<u16, String> {
    #[cfg(target_arch = "wasm32")]
    use myplugin_core::wasi::WasiSubstrate as Platform;
    #[cfg(not(target_arch = "wasm32"))]
    use myplugin_core::native::NativeSubstrate as Platform;

    ping_with(config, |c| Platform::with_timeout(c.connect_timeout()))
}

#[cfg(target_arch = "wasm32")]
mod component {
    mod bindings {
        wit_bindgen::generate!({
            path: "wit",
            world: "logcraft:lgc/plugins"
        });
    }
    use bindings::{
        export,
        exports::logcraft::lgc::plugin::{Guest, Metadata},
    };

    struct MyPlugin;

    impl Guest for MyPlugin {
        fn load() -> Metadata {
            let m = crate::load();
            Metadata {
                name: m.name,
                version: m.version,
                author: m.author,
                description: m.description,
            }
        }

        fn settings() -> String {
            crate::settings()
        }

        fn schema() -> String {
            crate::schema()
        }

        fn create(config: String, name: String, params: String) -> Result<Option<String>, String> {
            crate::create(&config, &name, &params)
        }

        fn read(config: String, name: String, params: String) -> Result<Option<String>, String> {
            crate::read(&config, &name, &params)
        }

        fn update(config: String, name: String, params: String) -> Result<Option<String>, String> {
            crate::update(&config, &name, &params)
        }

        fn delete(config: String, name: String, params: String) -> Result<Option<String>, String> {
            crate::delete(&config, &name, &params)
        }

        fn ping(config: String) -> Result<bool, String> {
            crate::ping(&config).map(|_| true)
        }
    }

    export!(MyPlugin with_types_in bindings);
}
