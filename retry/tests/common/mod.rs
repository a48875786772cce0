//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ckit_retry::{BreakerSettings, Coordinator, CoordinatorSettings, Policy};
use tracing_subscriber::EnvFilter;

/// Surface engine logs when RUST_LOG is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fixed 1ms gaps so loop tests stay fast.
pub fn fast_policy(max_attempts: u32) -> Policy {
    Policy::fixed(max_attempts, Duration::from_millis(1))
}

/// Coordinator with a short breaker window and fast policies for the
/// classes used in tests.
pub fn fast_coordinator(recovery_window: Duration) -> Coordinator {
    init_tracing();
    let coordinator = Coordinator::new(CoordinatorSettings {
        breaker: BreakerSettings {
            threshold: 5,
            recovery_window,
            half_open_successes: 2,
        },
        ..CoordinatorSettings::default()
    });
    for class in ["docker", "network", "flaky"] {
        coordinator
            .set_policy(class, fast_policy(3))
            .expect("valid policy");
    }
    coordinator
}

/// Shared invocation counter for closures.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicU32>);

impl Calls {
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}
