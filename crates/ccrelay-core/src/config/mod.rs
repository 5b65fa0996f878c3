//! Configuration snapshot: data model, loader, and reload handle.
//!
//! The engine itself only depends on [`model::Config`] — the on-disk
//! format and reload cadence are an out-of-scope collaborator's contract
//! (spec §1/§6). [`loader`] and [`reload`] are this repo's reference
//! implementation of that collaborator.

pub mod loader;
pub mod model;
pub mod reload;

pub use model::{
    Config, ConcurrencyConfig, ModelMapEntry, Provider, ProviderMode, ProviderType, RouteQueueConfig,
    RouteRule, RouteRuleKind, Routing,
};
pub use reload::ConfigHandle;
