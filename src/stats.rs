//! The counter interface consumed by both the capture assembler and the
//! replay worker/scheduler: atomic increments for a fixed set
//! of well-known names, a lock-protected map for anything else, and a
//! concurrent per-session "lagging" map whose global value is the maximum
//! across all sessions.
//!
//! The core never owns these counters in the sense of deciding what to do
//! with them — it only names and updates them. [`GlobalStats`] is a
//! process-wide default; callers that want to observe counters in a test
//! substitute their own `Arc<dyn Stats>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

pub trait Stats: Send + Sync {
    fn add(&self, name: &str, delta: i64);
    fn get(&self, name: &str) -> i64;
    fn dump(&self) -> HashMap<String, i64>;
    fn set_lagging(&self, session_id: &str, lagging: Duration);
    /// Zeroes a session's lagging entry, e.g. on worker termination.
    fn clear_lagging(&self, session_id: &str) {
        self.set_lagging(session_id, Duration::ZERO);
    }
    /// The maximum lagging value across all sessions.
    fn get_lagging(&self) -> Duration;
}

macro_rules! known_counters {
    ($($field:ident => $name:literal),+ $(,)?) => {
        #[derive(Default)]
        pub struct GlobalStats {
            $($field: AtomicI64,)+
            overflow: RwLock<HashMap<String, i64>>,
            lagging: RwLock<HashMap<String, Duration>>,
        }

        impl GlobalStats {
            pub fn new() -> Self {
                Self::default()
            }

            fn known_field(&self, name: &str) -> Option<&AtomicI64> {
                match name {
                    $($name => Some(&self.$field),)+
                    _ => None,
                }
            }
        }

        impl Stats for GlobalStats {
            fn add(&self, name: &str, delta: i64) {
                if let Some(counter) = self.known_field(name) {
                    counter.fetch_add(delta, Ordering::Relaxed);
                } else {
                    let mut overflow = self.overflow.write().expect("stats overflow map poisoned");
                    *overflow.entry(name.to_string()).or_insert(0) += delta;
                }
            }

            fn get(&self, name: &str) -> i64 {
                if let Some(counter) = self.known_field(name) {
                    counter.load(Ordering::Relaxed)
                } else {
                    let overflow = self.overflow.read().expect("stats overflow map poisoned");
                    overflow.get(name).copied().unwrap_or(0)
                }
            }

            fn dump(&self) -> HashMap<String, i64> {
                let mut out = HashMap::new();
                $(out.insert($name.to_string(), self.$field.load(Ordering::Relaxed));)+
                out.extend(self.overflow.read().expect("stats overflow map poisoned").clone());
                out
            }

            fn set_lagging(&self, session_id: &str, lagging: Duration) {
                let mut map = self.lagging.write().expect("lagging map poisoned");
                map.insert(session_id.to_string(), lagging);
            }

            fn get_lagging(&self) -> Duration {
                self.lagging
                    .read()
                    .expect("lagging map poisoned")
                    .values()
                    .max()
                    .copied()
                    .unwrap_or(Duration::ZERO)
            }
        }
    };
}

known_counters! {
    packets => "packets",
    data_in => "data.in",
    data_out => "data.out",
    queries => "queries",
    stmt_executes => "stmt.executes",
    stmt_prepares => "stmt.prepares",
    streams => "streams",
    connections => "connections",
    conn_waiting => "conn.waiting",
    conn_running => "conn.running",
    err_queries => "err.queries",
    err_stmt_executes => "err.stmt.executes",
    err_stmt_prepares => "err.stmt.prepares",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_counters_are_independent() {
        let stats = GlobalStats::new();
        stats.add("queries", 3);
        stats.add("err.queries", 1);
        assert_eq!(stats.get("queries"), 3);
        assert_eq!(stats.get("err.queries"), 1);
    }

    #[test]
    fn unknown_names_go_to_overflow_map() {
        let stats = GlobalStats::new();
        stats.add("custom.counter", 5);
        stats.add("custom.counter", 2);
        assert_eq!(stats.get("custom.counter"), 7);
        assert_eq!(stats.dump().get("custom.counter"), Some(&7));
    }

    #[test]
    fn lagging_reports_the_max_across_sessions() {
        let stats = GlobalStats::new();
        stats.set_lagging("a", Duration::from_millis(50));
        stats.set_lagging("b", Duration::from_millis(200));
        assert_eq!(stats.get_lagging(), Duration::from_millis(200));
        stats.clear_lagging("b");
        assert_eq!(stats.get_lagging(), Duration::from_millis(50));
    }

    #[test]
    fn counters_never_go_negative_under_balanced_add_and_subtract() {
        let stats = GlobalStats::new();
        stats.add("conn.running", 1);
        stats.add("conn.running", -1);
        assert_eq!(stats.get("conn.running"), 0);
    }
}
