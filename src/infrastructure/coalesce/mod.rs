//! Request Coalescing and Rate-Limit Cooldown
//!
//! Two small guards that sit in front of rate-limited upstream calls:
//!
//! - [`Singleflight`]: a keyed in-flight map. Concurrent callers asking for
//!   the same key share one upstream future; the entry is cleared once the
//!   call settles.
//! - [`CooldownGate`]: per call-class cooldown after an upstream 429. The
//!   cooldown grows geometrically on repeated rejections and resets to its
//!   floor on the next success.

use std::collections::HashMap;
use std::hash::Hash;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::Shared;
use parking_lot::Mutex;

// =============================================================================
// Call Classes
// =============================================================================

/// Classes of rate-limited upstream calls, each with its own cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallClass {
    /// Tradable-instrument listing.
    TokenList,
    /// Full order-book snapshot for one symbol.
    BookSnapshot,
}

impl CallClass {
    /// Label for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TokenList => "token_list",
            Self::BookSnapshot => "book_snapshot",
        }
    }
}

// =============================================================================
// Singleflight
// =============================================================================

type SharedFuture<V> = Shared<Pin<Box<dyn Future<Output = V> + Send>>>;

/// Keyed in-flight call deduplication.
///
/// The value type must be `Clone`: every waiter gets its own copy of the one
/// result. The inner lock is only held to look up or insert the shared
/// future, never across an await.
pub struct Singleflight<K, V> {
    inflight: Mutex<HashMap<K, SharedFuture<V>>>,
}

impl<K, V> std::fmt::Debug for Singleflight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Singleflight")
            .field("inflight", &self.inflight.lock().len())
            .finish()
    }
}

impl<K, V> Default for Singleflight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> Singleflight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// New empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key`, or join an identical call already in flight.
    ///
    /// Returns the value and whether this caller was the leader (the one
    /// that actually issued the upstream call).
    pub async fn run<F, Fut>(&self, key: K, make: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (future, leader) = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                (existing.clone(), false)
            } else {
                let future: SharedFuture<V> = make().boxed().shared();
                inflight.insert(key.clone(), future.clone());
                (future, true)
            }
        };

        let value = future.clone().await;

        if leader {
            let mut inflight = self.inflight.lock();
            // Only remove our own entry; a later call for the same key may
            // already have replaced it.
            if inflight.get(&key).is_some_and(|current| current.ptr_eq(&future)) {
                inflight.remove(&key);
            }
        }

        (value, leader)
    }

    /// Number of calls currently in flight.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}

// =============================================================================
// Cooldown Gate
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct CooldownState {
    blocked_until: Instant,
    current_backoff: Duration,
}

/// Per call-class cooldown after upstream rate-limit rejections.
#[derive(Debug)]
pub struct CooldownGate {
    floor: Duration,
    multiplier: f64,
    ceiling: Duration,
    states: Mutex<HashMap<CallClass, CooldownState>>,
}

impl CooldownGate {
    /// Create a gate with the given floor, growth factor, and ceiling.
    #[must_use]
    pub fn new(floor: Duration, multiplier: f64, ceiling: Duration) -> Self {
        Self {
            floor,
            multiplier,
            ceiling,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Remaining cooldown for `class`, or `None` if calls are allowed.
    #[must_use]
    pub fn check(&self, class: CallClass) -> Option<Duration> {
        let states = self.states.lock();
        let state = states.get(&class)?;
        let now = Instant::now();
        if now < state.blocked_until {
            Some(state.blocked_until - now)
        } else {
            None
        }
    }

    /// Record an upstream rate-limit rejection for `class`.
    ///
    /// The first rejection blocks for the floor; each further rejection
    /// multiplies the backoff, capped at the ceiling.
    pub fn on_rate_limited(&self, class: CallClass) {
        let mut states = self.states.lock();
        let backoff = match states.get(&class) {
            Some(state) => {
                #[allow(clippy::cast_precision_loss)]
                let grown = state.current_backoff.as_millis() as f64 * self.multiplier;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let grown = Duration::from_millis(grown.round().max(1.0) as u64);
                grown.min(self.ceiling)
            }
            None => self.floor,
        };
        states.insert(
            class,
            CooldownState {
                blocked_until: Instant::now() + backoff,
                current_backoff: backoff,
            },
        );
    }

    /// Record an upstream success for `class`, resetting it to the floor.
    pub fn on_success(&self, class: CallClass) {
        self.states.lock().remove(&class);
    }

    /// The backoff the next rejection for `class` would start from.
    #[must_use]
    pub fn current_backoff(&self, class: CallClass) -> Duration {
        self.states
            .lock()
            .get(&class)
            .map_or(self.floor, |s| s.current_backoff)
    }
}
