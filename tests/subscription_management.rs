//! Subscription Multiplexer Integration Tests
//!
//! Cap enforcement, origin semantics, and refcount lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use feedmux::{SubscriptionManager, SubscriptionOrigin, Symbol, UnsubscribeOutcome};
use proptest::prelude::*;

fn sym(raw: &str) -> Symbol {
    Symbol::normalize(raw).unwrap()
}

// =============================================================================
// Cap Enforcement
// =============================================================================

#[test]
fn cap_rejects_new_symbols_but_not_existing_ones() {
    let manager = SubscriptionManager::new(2);

    assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::Client));
    assert!(manager.subscribe(sym("ETH"), SubscriptionOrigin::System));

    // At the cap: a third symbol is rejected outright.
    assert!(!manager.subscribe(sym("SOL"), SubscriptionOrigin::Client));
    assert_eq!(manager.active_count(), 2);

    // An already-active symbol still accepts more holders.
    assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::Client));
    assert!(manager.subscribe(sym("ETH"), SubscriptionOrigin::Client));
    assert_eq!(manager.active_count(), 2);
}

#[test]
fn rejected_subscribe_leaves_no_trace() {
    let manager = SubscriptionManager::new(1);
    assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::Client));
    assert!(!manager.subscribe(sym("ETH"), SubscriptionOrigin::Client));

    assert!(!manager.is_active(&sym("ETH")));
    assert_eq!(
        manager.unsubscribe(&sym("ETH"), SubscriptionOrigin::Client),
        UnsubscribeOutcome::NotSubscribed
    );
}

// =============================================================================
// Origin Semantics
// =============================================================================

#[test]
fn system_subscriptions_are_idempotent() {
    let manager = SubscriptionManager::new(10);

    assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::System));
    assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::System));
    assert_eq!(manager.active_count(), 1);

    // One unsubscribe removes the system hold entirely.
    assert_eq!(
        manager.unsubscribe(&sym("BTC"), SubscriptionOrigin::System),
        UnsubscribeOutcome::BecameInactive
    );
    assert!(!manager.is_active(&sym("BTC")));
}

#[test]
fn client_refcounts_stack_and_drain() {
    let manager = SubscriptionManager::new(10);

    for _ in 0..3 {
        assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::Client));
    }
    assert_eq!(manager.client_refcount(&sym("BTC")), 3);

    assert_eq!(
        manager.unsubscribe(&sym("BTC"), SubscriptionOrigin::Client),
        UnsubscribeOutcome::Retained
    );
    assert_eq!(
        manager.unsubscribe(&sym("BTC"), SubscriptionOrigin::Client),
        UnsubscribeOutcome::Retained
    );
    assert_eq!(
        manager.unsubscribe(&sym("BTC"), SubscriptionOrigin::Client),
        UnsubscribeOutcome::BecameInactive
    );
}

#[test]
fn symbol_stays_active_while_any_origin_holds_it() {
    let manager = SubscriptionManager::new(10);

    assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::System));
    assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::Client));

    // Dropping the client ref keeps the system hold alive.
    assert_eq!(
        manager.unsubscribe(&sym("BTC"), SubscriptionOrigin::Client),
        UnsubscribeOutcome::Retained
    );
    assert!(manager.is_active(&sym("BTC")));

    assert_eq!(
        manager.unsubscribe(&sym("BTC"), SubscriptionOrigin::System),
        UnsubscribeOutcome::BecameInactive
    );
}

#[test]
fn active_symbols_are_sorted_and_deduplicated() {
    let manager = SubscriptionManager::new(10);
    assert!(manager.subscribe(sym("ETH"), SubscriptionOrigin::Client));
    assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::System));
    assert!(manager.subscribe(sym("BTC"), SubscriptionOrigin::Client));

    assert_eq!(manager.active_symbols(), vec![sym("BTC"), sym("ETH")]);
}

// =============================================================================
// Property Tests
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Subscribe(u8, bool),
    Unsubscribe(u8, bool),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, any::<bool>()).prop_map(|(s, sys)| Op::Subscribe(s, sys)),
        (0u8..6, any::<bool>()).prop_map(|(s, sys)| Op::Unsubscribe(s, sys)),
    ]
}

fn op_symbol(id: u8) -> Symbol {
    Symbol::normalize(&format!("SYM{id}")).unwrap()
}

const fn op_origin(system: bool) -> SubscriptionOrigin {
    if system {
        SubscriptionOrigin::System
    } else {
        SubscriptionOrigin::Client
    }
}

proptest! {
    #[test]
    fn active_count_never_exceeds_cap(ops in prop::collection::vec(op_strategy(), 0..100)) {
        let cap = 3;
        let manager = SubscriptionManager::new(cap);

        for op in ops {
            match op {
                Op::Subscribe(id, system) => {
                    let _ = manager.subscribe(op_symbol(id), op_origin(system));
                }
                Op::Unsubscribe(id, system) => {
                    let _ = manager.unsubscribe(&op_symbol(id), op_origin(system));
                }
            }
            prop_assert!(manager.active_count() <= cap);
        }
    }

    #[test]
    fn became_inactive_is_reported_exactly_once(subs in 1usize..10) {
        let manager = SubscriptionManager::new(10);
        for _ in 0..subs {
            prop_assert!(manager.subscribe(op_symbol(0), SubscriptionOrigin::Client));
        }

        let mut inactive_count = 0;
        for _ in 0..subs {
            if manager.unsubscribe(&op_symbol(0), SubscriptionOrigin::Client)
                == UnsubscribeOutcome::BecameInactive
            {
                inactive_count += 1;
            }
        }

        prop_assert_eq!(inactive_count, 1);
        prop_assert!(!manager.is_active(&op_symbol(0)));
    }
}
