use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// How long a route counts as "processing" after a request.
pub const ROUTE_ACTIVITY_WINDOW: Duration = Duration::from_secs(20);

/// Records the last request time per route. Used only to steer the health
/// checker between timed and untimed cooling: a probe failure on an active
/// route reschedules, on an idle route it parks the target untimed.
#[derive(Default)]
pub struct RouteActivityTracker {
    last: RwLock<HashMap<String, Instant>>,
}

impl RouteActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, route_id: &str) {
        if route_id.is_empty() {
            return;
        }
        if let Ok(mut last) = self.last.write() {
            last.insert(route_id.to_string(), Instant::now());
        }
    }

    pub fn is_processing(&self, route_id: &str) -> bool {
        let last = match self.last.read() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match last.get(route_id) {
            Some(t) => t.elapsed() < ROUTE_ACTIVITY_WINDOW,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_route_is_idle() {
        let tracker = RouteActivityTracker::new();
        assert!(!tracker.is_processing("route-1"));
    }

    #[test]
    fn test_marked_route_is_processing() {
        let tracker = RouteActivityTracker::new();
        tracker.mark("route-1");
        assert!(tracker.is_processing("route-1"));
        assert!(!tracker.is_processing("route-2"));
    }

    #[test]
    fn test_empty_route_id_ignored() {
        let tracker = RouteActivityTracker::new();
        tracker.mark("");
        assert!(!tracker.is_processing(""));
    }
}
