//! Optimistic-concurrency bookkeeping
//!
//! The ledger holds the opaque version token captured by the last
//! CAS-flavored read of each key. Tokens are consumed by a conditioned
//! write and invalidated by any unconditioned write or delete on the same
//! key, so a caller mixing `cas_get` and plain `set` still gets the
//! concurrency check it implicitly asked for.

use std::collections::HashMap;

use crate::backend::CasToken;

/// Per-key version tokens for one logical unit of work.
#[derive(Debug, Default)]
pub struct CasLedger {
    tokens: HashMap<String, CasToken>,
}

impl CasLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the token captured by a successful CAS read.
    pub fn record(&mut self, key: &str, token: CasToken) {
        self.tokens.insert(key.to_owned(), token);
    }

    /// Remove and return the token for `key`. Used by conditioned writes:
    /// whether the compare succeeds or fails, the token is spent.
    pub fn take(&mut self, key: &str) -> Option<CasToken> {
        self.tokens.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tokens.contains_key(key)
    }

    /// Drop the token after an unconditioned write or delete.
    pub fn invalidate(&mut self, key: &str) {
        self.tokens.remove(key);
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(n: u8) -> CasToken {
        CasToken::new(vec![n])
    }

    #[test]
    fn record_and_take() {
        let mut ledger = CasLedger::new();
        ledger.record("k", token(1));
        assert!(ledger.contains("k"));
        assert_eq!(ledger.take("k"), Some(token(1)));
        // Consumed: a second take finds nothing.
        assert_eq!(ledger.take("k"), None);
    }

    #[test]
    fn invalidate_drops_token() {
        let mut ledger = CasLedger::new();
        ledger.record("k", token(1));
        ledger.invalidate("k");
        assert!(!ledger.contains("k"));
    }

    #[test]
    fn newer_read_replaces_token() {
        let mut ledger = CasLedger::new();
        ledger.record("k", token(1));
        ledger.record("k", token(2));
        assert_eq!(ledger.take("k"), Some(token(2)));
    }

    #[test]
    fn clear_drops_everything() {
        let mut ledger = CasLedger::new();
        ledger.record("a", token(1));
        ledger.record("b", token(2));
        ledger.clear();
        assert!(!ledger.contains("a"));
        assert!(!ledger.contains("b"));
    }
}
