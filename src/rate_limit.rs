// =============================================================================
// Fixed-Window Rate Limiter — upstream and per-consumer admission
// =============================================================================
//
// Two instances run side by side:
//   - `upstream`: one global actor, bounds what we send to OKX (public market
//     endpoints allow 20 requests / 2 s per IP).
//   - `consumer`: one actor per inbound consumer identity.
//
// Every actor owns its window behind its own mutex; the actor map is only
// locked long enough to find or insert that mutex. `admit_all` locks the
// windows of every participating limiter before deciding, so a request is
// either charged everywhere or nowhere. Each gate carries its own cost: a
// multi-instrument request is one request to its consumer but several calls
// against the upstream window.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Above this many tracked actors, expired windows are dropped on insert.
const PRUNE_THRESHOLD: usize = 10_000;

// =============================================================================
// RateWindow
// =============================================================================

#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    count: u32,
    limit: u32,
}

impl RateWindow {
    fn new(now: Instant, limit: u32) -> Self {
        Self {
            window_start: now,
            count: 0,
            limit,
        }
    }

    fn is_expired(&self, now: Instant, duration: Duration) -> bool {
        now >= self.window_start + duration
    }

    /// Start a fresh window if the current one has run out.
    fn roll(&mut self, now: Instant, duration: Duration) {
        if self.is_expired(now, duration) {
            self.window_start = now;
            self.count = 0;
        }
    }

    fn has_room(&self, cost: u32) -> bool {
        self.count.saturating_add(cost) <= self.limit
    }
}

/// Copy of one actor's window, suitable for a status payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateWindowSnapshot {
    pub namespace: &'static str,
    pub actor: String,
    pub count: u32,
    pub limit: u32,
    pub resets_in_ms: u64,
}

// =============================================================================
// RateLimiter
// =============================================================================

pub struct RateLimiter {
    namespace: &'static str,
    limit: u32,
    window: Duration,
    windows: RwLock<HashMap<String, Arc<Mutex<RateWindow>>>>,
}

impl RateLimiter {
    pub fn new(namespace: &'static str, limit: u32, window: Duration) -> Self {
        debug!(namespace, limit, window_ms = window.as_millis() as u64, "rate limiter created");
        Self {
            namespace,
            limit,
            window,
            windows: RwLock::new(HashMap::new()),
        }
    }

    fn window_for(&self, actor: &str) -> Arc<Mutex<RateWindow>> {
        if let Some(w) = self.windows.read().get(actor) {
            return w.clone();
        }

        let mut map = self.windows.write();
        if map.len() >= PRUNE_THRESHOLD {
            let now = Instant::now();
            let window = self.window;
            let before = map.len();
            // A window some admission already holds a handle to is kept, even
            // if it has not locked it yet; dropping it would let that charge
            // land on a detached window.
            map.retain(|_, w| {
                Arc::strong_count(w) > 1
                    || w.try_lock().map_or(true, |g| !g.is_expired(now, window))
            });
            debug!(namespace = self.namespace, pruned = before - map.len(), "expired rate windows dropped");
        }
        map.entry(actor.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateWindow::new(Instant::now(), self.limit))))
            .clone()
    }

    /// Charge `cost` to `actor` if it fits in the current window. A rejected
    /// call leaves the window untouched.
    pub fn admit(&self, actor: &str, cost: u32) -> bool {
        admit_all(&[(self, actor, cost)])
    }

    /// Start a fresh, empty window for `actor`. Returns `false` when the
    /// actor has never been seen.
    pub fn reset(&self, actor: &str) -> bool {
        let Some(w) = self.windows.read().get(actor).cloned() else {
            return false;
        };
        let mut guard = w.lock();
        guard.window_start = Instant::now();
        guard.count = 0;
        info!(namespace = self.namespace, actor, "rate window reset");
        true
    }

    pub fn snapshot(&self, actor: &str) -> Option<RateWindowSnapshot> {
        let window = self.windows.read().get(actor).cloned()?;
        let mut guard = window.lock();
        let now = Instant::now();
        guard.roll(now, self.window);
        let resets_at = guard.window_start + self.window;
        Some(RateWindowSnapshot {
            namespace: self.namespace,
            actor: actor.to_string(),
            count: guard.count,
            limit: guard.limit,
            resets_in_ms: resets_at.saturating_duration_since(now).as_millis() as u64,
        })
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("namespace", &self.namespace)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("actors", &self.windows.read().len())
            .finish()
    }
}

// =============================================================================
// Joint admission
// =============================================================================

/// Charge each `(limiter, actor, cost)` gate, or none of them.
///
/// Windows are locked in slice order and held until the decision is made.
/// Callers must pass limiters in the same order every time and must not list
/// the same limiter twice.
pub fn admit_all(gates: &[(&RateLimiter, &str, u32)]) -> bool {
    let now = Instant::now();
    let windows: Vec<Arc<Mutex<RateWindow>>> = gates
        .iter()
        .map(|(limiter, actor, _)| limiter.window_for(actor))
        .collect();

    let mut guards: Vec<_> = windows.iter().map(|w| w.lock()).collect();
    for ((limiter, _, _), guard) in gates.iter().zip(guards.iter_mut()) {
        guard.roll(now, limiter.window);
    }

    let blocked = gates
        .iter()
        .zip(guards.iter())
        .find(|((_, _, cost), guard)| !guard.has_room(*cost));

    if let Some(((limiter, actor, cost), guard)) = blocked {
        warn!(
            namespace = limiter.namespace,
            actor,
            count = guard.count,
            limit = guard.limit,
            cost,
            "request blocked — rate window exhausted"
        );
        return false;
    }

    for ((_, _, cost), guard) in gates.iter().zip(guards.iter_mut()) {
        guard.count += cost;
    }
    true
}

// =============================================================================
// Tests
// =============================================================================
