//! Request classifier: method+path+headers -> `{Block, Passthrough, Route}`.
//!
//! Evaluation order is fixed (spec §4.2): `block` rules, then
//! `passthrough`, then `route`, then the default route. Each rule kind's
//! compiled globs are rebuilt whenever the `Config` snapshot changes, since
//! globs are immutable once compiled.

use crate::config::{Config, RouteRule};
use crate::matcher::{GlobSet, MatcherError};
use std::sync::Arc;

/// Normalized view of an inbound request handed to the classifier. Method
/// comparisons are case-insensitive; path comparisons are case-sensitive
/// (spec §4.1).
pub struct RequestView<'a> {
    pub method: &'a str,
    pub path: &'a str,
}

#[derive(Debug, Clone)]
pub enum Classification {
    Block {
        status: u16,
        body: serde_json::Value,
    },
    Passthrough {
        provider_id: String,
        route_queue_key: String,
    },
    Route {
        provider_id: String,
        route_queue_key: String,
    },
}

struct CompiledRules {
    block: GlobSet<RouteRule>,
    passthrough: GlobSet<RouteRule>,
    route: GlobSet<RouteRule>,
}

/// Classifies requests against one `Config` snapshot. Cheap to rebuild
/// (O(number of rules)); the orchestrator rebuilds one per config reload,
/// not per request.
pub struct Classifier {
    rules: CompiledRules,
    /// `RouteQueueConfig.matchPath` predicates, keyed by the queue's `key`
    /// (spec §3 "matching predicate over request"). Consulted whenever a
    /// matched rule doesn't name a `routeQueueKey` explicitly.
    route_queues: GlobSet<String>,
    default_provider: String,
}

impl Classifier {
    pub fn from_config(config: &Config) -> Result<Self, MatcherError> {
        let mut block = GlobSet::new();
        for rule in &config.routing.block {
            block.push(&rule.path, rule.clone())?;
        }
        let mut passthrough = GlobSet::new();
        for rule in &config.routing.passthrough {
            passthrough.push(&rule.path, rule.clone())?;
        }
        let mut route = GlobSet::new();
        for rule in &config.routing.route {
            route.push(&rule.path, rule.clone())?;
        }
        let mut route_queues = GlobSet::new();
        for rq in &config.route_queues {
            if let Some(pattern) = &rq.match_path {
                route_queues.push(pattern, rq.key.clone())?;
            }
        }
        Ok(Self {
            rules: CompiledRules {
                block,
                passthrough,
                route,
            },
            route_queues,
            default_provider: config.default_provider.clone(),
        })
    }

    /// Resolve the queue key for a path when the matched rule left
    /// `routeQueueKey` unset: fall back to the first `RouteQueueConfig`
    /// whose `matchPath` predicate matches, then to `"default"`.
    fn resolve_queue_key(&self, path: &str) -> String {
        self.route_queues
            .find(path)
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    }

    /// Classify a single request. `current_provider` is the
    /// snapshot-at-task-start value of the leader-owned atomic selector
    /// (spec §4.2, §9 "Module-level current provider").
    pub fn classify(&self, req: &RequestView<'_>, current_provider: &str) -> Classification {
        if let Some(rule) = self.rules.block.find(req.path) {
            return Classification::Block {
                status: rule.response_code.unwrap_or(200),
                body: rule
                    .response_body
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
            };
        }
        if let Some(rule) = self.rules.passthrough.find(req.path) {
            let provider_id = rule
                .provider_id
                .clone()
                .unwrap_or_else(|| self.default_provider.clone());
            let route_queue_key = rule
                .route_queue_key
                .clone()
                .unwrap_or_else(|| self.resolve_queue_key(req.path));
            return Classification::Passthrough {
                provider_id,
                route_queue_key,
            };
        }
        if let Some(rule) = self.rules.route.find(req.path) {
            let provider_id = rule
                .provider_id
                .clone()
                .unwrap_or_else(|| current_provider.to_string());
            let route_queue_key = rule
                .route_queue_key
                .clone()
                .unwrap_or_else(|| self.resolve_queue_key(req.path));
            return Classification::Route {
                provider_id,
                route_queue_key,
            };
        }
        Classification::Route {
            provider_id: current_provider.to_string(),
            route_queue_key: self.resolve_queue_key(req.path),
        }
    }
}

/// The leader-owned, process-wide "current provider" selector. A single
/// atomic cell; readers snapshot it once at task start and never see it
/// change mid-flight (spec §4.2, §5, §9).
#[derive(Clone)]
pub struct CurrentProvider(Arc<arc_swap::ArcSwap<String>>);

impl CurrentProvider {
    pub fn new(initial: String) -> Self {
        Self(Arc::new(arc_swap::ArcSwap::from_pointee(initial)))
    }

    pub fn get(&self) -> Arc<String> {
        self.0.load_full()
    }

    pub fn set(&self, id: String) {
        self.0.store(Arc::new(id));
    }
}
