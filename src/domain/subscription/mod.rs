//! Subscription Multiplexer
//!
//! Tracks the set of actively-tracked symbols, split into system-mandated
//! subscriptions (a set, idempotent) and client subscriptions (reference
//! counted). A symbol is *active* iff it is in the system set or has a client
//! refcount > 0. The active set is capped: a subscribe that would exceed the
//! cap is rejected with a typed negative result and leaves state unchanged.
//!
//! # Design
//!
//! Multiple clients can track the same symbol while the aggregator maintains
//! only one upstream subscription per venue. Eviction side effects (cache
//! entry, external metric series, venue unsubscribe) are driven by the
//! [`UnsubscribeOutcome`] returned to the caller; this module holds no
//! references to the things it indirectly retires.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::domain::symbol::Symbol;

/// Who asked for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionOrigin {
    /// Mandated by the system (bootstrap list, pipeline demand). Idempotent.
    System,
    /// Requested by a connected client. Reference counted.
    Client,
}

/// Result of an unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// The symbol is still active (other holders remain).
    Retained,
    /// The symbol just became inactive; the caller must evict derived state.
    BecameInactive,
    /// The symbol was not subscribed under that origin.
    NotSubscribed,
}

#[derive(Debug, Default)]
struct MultiplexerState {
    system: HashSet<Symbol>,
    client_refs: HashMap<Symbol, usize>,
}

impl MultiplexerState {
    fn is_active(&self, symbol: &Symbol) -> bool {
        self.system.contains(symbol) || self.client_refs.contains_key(symbol)
    }

    fn active_count(&self) -> usize {
        let mut count = self.system.len();
        for symbol in self.client_refs.keys() {
            if !self.system.contains(symbol) {
                count += 1;
            }
        }
        count
    }
}

/// Statistics snapshot for health reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionStats {
    /// Number of active symbols (system ∪ client).
    pub active: usize,
    /// Number of system-mandated symbols.
    pub system: usize,
    /// Number of client-refcounted symbols.
    pub client: usize,
    /// Configured active-set cap.
    pub cap: usize,
}

/// Thread-safe subscription multiplexer with an active-set cap.
///
/// # Example
///
/// ```rust
/// use feedmux::domain::subscription::{SubscriptionManager, SubscriptionOrigin, UnsubscribeOutcome};
/// use feedmux::domain::symbol::Symbol;
///
/// let manager = SubscriptionManager::new(10);
/// let btc = Symbol::normalize("BTC").unwrap();
///
/// assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::Client));
/// assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::Client));
///
/// // First unsubscribe leaves the refcount at 1.
/// assert_eq!(
///     manager.unsubscribe(&btc, SubscriptionOrigin::Client),
///     UnsubscribeOutcome::Retained
/// );
/// assert_eq!(
///     manager.unsubscribe(&btc, SubscriptionOrigin::Client),
///     UnsubscribeOutcome::BecameInactive
/// );
/// ```
#[derive(Debug)]
pub struct SubscriptionManager {
    state: RwLock<MultiplexerState>,
    cap: usize,
}

impl SubscriptionManager {
    /// Create a manager with the given active-set cap.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            state: RwLock::new(MultiplexerState::default()),
            cap,
        }
    }

    /// Subscribe a symbol under an origin.
    ///
    /// Returns `false` (state unchanged) when the symbol is not already
    /// active and the active set is at the cap. Callers must treat `false`
    /// as "not subscribed".
    pub fn subscribe(&self, symbol: Symbol, origin: SubscriptionOrigin) -> bool {
        let mut state = self.state.write();

        if !state.is_active(&symbol) && state.active_count() >= self.cap {
            return false;
        }

        match origin {
            SubscriptionOrigin::System => {
                state.system.insert(symbol);
            }
            SubscriptionOrigin::Client => {
                *state.client_refs.entry(symbol).or_insert(0) += 1;
            }
        }
        true
    }

    /// Unsubscribe a symbol under an origin.
    ///
    /// Client origin decrements the refcount (removing at zero); system
    /// origin removes from the system set. The outcome tells the caller
    /// whether derived state must be evicted.
    pub fn unsubscribe(&self, symbol: &Symbol, origin: SubscriptionOrigin) -> UnsubscribeOutcome {
        let mut state = self.state.write();

        let held = match origin {
            SubscriptionOrigin::System => state.system.remove(symbol),
            SubscriptionOrigin::Client => match state.client_refs.get_mut(symbol) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    return UnsubscribeOutcome::Retained;
                }
                Some(_) => {
                    state.client_refs.remove(symbol);
                    true
                }
                None => false,
            },
        };

        if !held {
            return UnsubscribeOutcome::NotSubscribed;
        }
        if state.is_active(symbol) {
            UnsubscribeOutcome::Retained
        } else {
            UnsubscribeOutcome::BecameInactive
        }
    }

    /// Whether a symbol is currently active.
    #[must_use]
    pub fn is_active(&self, symbol: &Symbol) -> bool {
        self.state.read().is_active(symbol)
    }

    /// All active symbols, sorted for deterministic iteration.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let state = self.state.read();
        let mut symbols: Vec<Symbol> = state
            .system
            .iter()
            .chain(state.client_refs.keys())
            .cloned()
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Number of active symbols.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.read().active_count()
    }

    /// Current client refcount for a symbol (0 if none).
    #[must_use]
    pub fn client_refcount(&self, symbol: &Symbol) -> usize {
        self.state.read().client_refs.get(symbol).copied().unwrap_or(0)
    }

    /// Remove every subscription. Shutdown teardown.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.system.clear();
        state.client_refs.clear();
    }

    /// Statistics snapshot for health reporting.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.read();
        SubscriptionStats {
            active: state.active_count(),
            system: state.system.len(),
            client: state.client_refs.len(),
            cap: self.cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(raw: &str) -> Symbol {
        Symbol::normalize(raw).unwrap()
    }

    #[test]
    fn client_refcount_lifecycle() {
        let manager = SubscriptionManager::new(10);
        let btc = sym("BTC");

        assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::Client));
        assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::Client));
        assert_eq!(manager.client_refcount(&btc), 2);

        assert_eq!(
            manager.unsubscribe(&btc, SubscriptionOrigin::Client),
            UnsubscribeOutcome::Retained
        );
        assert!(manager.is_active(&btc));

        assert_eq!(
            manager.unsubscribe(&btc, SubscriptionOrigin::Client),
            UnsubscribeOutcome::BecameInactive
        );
        assert!(!manager.is_active(&btc));
    }

    #[test]
    fn system_subscription_is_idempotent() {
        let manager = SubscriptionManager::new(10);
        let eth = sym("ETH");

        assert!(manager.subscribe(eth.clone(), SubscriptionOrigin::System));
        assert!(manager.subscribe(eth.clone(), SubscriptionOrigin::System));
        assert_eq!(manager.active_count(), 1);

        assert_eq!(
            manager.unsubscribe(&eth, SubscriptionOrigin::System),
            UnsubscribeOutcome::BecameInactive
        );
    }

    #[test]
    fn system_holds_symbol_past_client_release() {
        let manager = SubscriptionManager::new(10);
        let btc = sym("BTC");

        assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::System));
        assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::Client));

        assert_eq!(
            manager.unsubscribe(&btc, SubscriptionOrigin::Client),
            UnsubscribeOutcome::Retained
        );
        assert!(manager.is_active(&btc));

        assert_eq!(
            manager.unsubscribe(&btc, SubscriptionOrigin::System),
            UnsubscribeOutcome::BecameInactive
        );
    }

    #[test]
    fn cap_rejects_without_mutating() {
        let manager = SubscriptionManager::new(2);
        assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::Client));
        assert!(manager.subscribe(sym("ETH"), SubscriptionOrigin::System));

        assert!(!manager.subscribe(sym("SOL"), SubscriptionOrigin::Client));
        assert_eq!(manager.active_count(), 2);
        assert!(!manager.is_active(&sym("SOL")));
    }

    #[test]
    fn cap_allows_existing_symbol() {
        let manager = SubscriptionManager::new(1);
        let btc = sym("BTC");
        assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::Client));

        // Already active: a second holder does not count against the cap.
        assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::System));
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn unsubscribe_unknown_symbol() {
        let manager = SubscriptionManager::new(10);
        assert_eq!(
            manager.unsubscribe(&sym("BTC"), SubscriptionOrigin::Client),
            UnsubscribeOutcome::NotSubscribed
        );
        assert_eq!(
            manager.unsubscribe(&sym("BTC"), SubscriptionOrigin::System),
            UnsubscribeOutcome::NotSubscribed
        );
    }

    #[test]
    fn active_symbols_deduplicates_origins() {
        let manager = SubscriptionManager::new(10);
        let btc = sym("BTC");
        assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::System));
        assert!(manager.subscribe(btc.clone(), SubscriptionOrigin::Client));
        assert!(manager.subscribe(sym("ETH"), SubscriptionOrigin::Client));

        assert_eq!(manager.active_symbols(), vec![sym("BTC"), sym("ETH")]);
    }

    #[test]
    fn stats_reflect_state() {
        let manager = SubscriptionManager::new(5);
        assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::System));
        assert!(manager.subscribe(sym("ETH"), SubscriptionOrigin::Client));

        let stats = manager.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.system, 1);
        assert_eq!(stats.client, 1);
        assert_eq!(stats.cap, 5);
    }

    #[test]
    fn thread_safety_concurrent_subscribes() {
        use std::sync::Arc;
        use std::thread;

        let manager = Arc::new(SubscriptionManager::new(64));
        let mut handles = vec![];

        for i in 0..8 {
            let m = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                m.subscribe(sym(&format!("SYM{i}")), SubscriptionOrigin::Client);
                m.subscribe(sym("SHARED"), SubscriptionOrigin::Client);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(manager.active_count(), 9);
        assert_eq!(manager.client_refcount(&sym("SHARED")), 8);
    }
}
