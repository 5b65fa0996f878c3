//! The `Config` snapshot consumed by the classifier, transformer, and
//! concurrency manager. This is the contract shape for the on-disk
//! configuration loader, which is itself an out-of-scope collaborator — the
//! engine only ever depends on these types, never on how they were
//! produced.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upstream mode: `passthrough` forwards the inbound body and headers
/// untouched; `inject` rewrites the model name and injects provider
/// credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Passthrough,
    Inject,
}

/// Wire shape for a provider, distinguishing which auth convention it uses
/// when `mode == Inject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Anthropic,
    Openai,
}

/// One `{pattern, model}` entry in an ordered model map. Order is load
/// bearing: first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapEntry {
    pub pattern: String,
    pub model: String,
}

/// An upstream API endpoint with credentials and transformation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub mode: ProviderMode,
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default)]
    pub model_map: Vec<ModelMapEntry>,
    #[serde(default)]
    pub vl_model_map: Vec<ModelMapEntry>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Provider {
    /// The header auth credentials get injected under, per the provider
    /// type's convention, unless an explicit `authHeader` override is set.
    pub fn effective_auth_header(&self) -> &str {
        match &self.auth_header {
            Some(h) => h.as_str(),
            None => match self.provider_type {
                ProviderType::Anthropic => "x-api-key",
                ProviderType::Openai => "authorization",
            },
        }
    }

    /// The value to place in `effective_auth_header()`, e.g. `Bearer sk-...`
    /// for OpenAI-shaped providers, or the bare key for Anthropic-shaped
    /// ones.
    pub fn auth_header_value(&self) -> Option<String> {
        let key = self.api_key.as_ref()?;
        Some(match self.provider_type {
            ProviderType::Anthropic => key.clone(),
            ProviderType::Openai => format!("Bearer {key}"),
        })
    }
}

/// The kind of rule; evaluated in this declared order at classification
/// time: `block`, then `passthrough`, then `route`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteRuleKind {
    Block,
    Passthrough,
    Route,
}

/// A single classification rule. `path` is a glob (see `crate::matcher`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    pub path: String,
    #[serde(default)]
    pub kind: Option<RouteRuleKind>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub response_code: Option<u16>,
    #[serde(default)]
    pub response_body: Option<serde_json::Value>,
    #[serde(default)]
    pub route_queue_key: Option<String>,
}

/// Worker-pool sizing for a single queue key. Immutable per queue
/// instance; a reload rebuilds the queue rather than mutating it in place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    pub max_workers: usize,
    pub max_queue_size: usize,
    pub queue_wait_timeout_sec: f64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            max_queue_size: 64,
            queue_wait_timeout_sec: 30.0,
        }
    }
}

/// A named queue, selected by a predicate over the request (here: a glob
/// over the path, matching the `RouteRule.routeQueueKey` convention), plus
/// its own concurrency sizing and dispatch priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteQueueConfig {
    pub key: String,
    #[serde(default)]
    pub match_path: Option<String>,
    #[serde(flatten)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub priority: i64,
}

/// Grouped routing rules, matching the wire shape of the `routing` field in
/// the configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default)]
    pub block: Vec<RouteRule>,
    #[serde(default)]
    pub passthrough: Vec<RouteRule>,
    #[serde(default)]
    pub route: Vec<RouteRule>,
}

/// The full configuration snapshot. Produced by the config loader, held
/// behind an `Arc`, and atomically swapped on reload — never mutated in
/// place while a request may be reading it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub providers: HashMap<String, Provider>,
    pub default_provider: String,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,
    #[serde(default)]
    pub route_queues: Vec<RouteQueueConfig>,
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_sec: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_proxy_timeout() -> u64 {
    60
}

impl Config {
    /// Validate structural invariants that the wire format alone can't
    /// express: the default provider must exist and be enabled, every
    /// route rule naming a provider must reference one that exists, and
    /// every concurrency knob must be non-degenerate.
    pub fn validate(&self) -> Result<(), String> {
        if !self.providers.contains_key(&self.default_provider) {
            return Err(format!(
                "defaultProvider {:?} is not a configured provider",
                self.default_provider
            ));
        }
        for rule in self
            .routing
            .route
            .iter()
            .chain(self.routing.passthrough.iter())
        {
            if let Some(pid) = &rule.provider_id {
                if !self.providers.contains_key(pid) {
                    return Err(format!(
                        "route rule {:?} references unknown provider {:?}",
                        rule.path, pid
                    ));
                }
            }
        }
        if let Some(cfg) = &self.concurrency {
            validate_concurrency(cfg)?;
        }
        for rq in &self.route_queues {
            validate_concurrency(&rq.concurrency)?;
        }
        Ok(())
    }

    /// The `ConcurrencyConfig` used for the default queue key, falling back
    /// to a sane default when the snapshot doesn't specify one.
    pub fn default_concurrency(&self) -> ConcurrencyConfig {
        self.concurrency.unwrap_or_default()
    }
}

fn validate_concurrency(cfg: &ConcurrencyConfig) -> Result<(), String> {
    if cfg.max_workers < 1 {
        return Err("maxWorkers must be >= 1".to_string());
    }
    if cfg.queue_wait_timeout_sec <= 0.0 {
        return Err("queueWaitTimeoutSec must be > 0".to_string());
    }
    Ok(())
}
