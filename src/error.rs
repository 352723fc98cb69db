//! Cache error types

/// Crate-level error.
///
/// Misconfiguration is the only failure a client ever surfaces, and only at
/// construction time. Backend and codec failures are absorbed by the clients
/// and show up as degraded return values (`None`, `false`, empty maps).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid configuration: {0}")]
    Config(String),
}
