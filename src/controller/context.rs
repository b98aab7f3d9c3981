use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::OperatorConfig;
use crate::controller::error::BackoffConfig;
use crate::controller::members::MemberSetManager;
use crate::controller::platform::ClusterPlatform;
use crate::controller::status::StatusAggregator;
use crate::health::HealthState;

/// State shared by every reconcile pass
#[derive(Clone)]
pub struct Context {
    /// Platform the cluster is realised on
    pub platform: Arc<dyn ClusterPlatform>,
    /// Health state for metrics recording (optional)
    pub health_state: Option<Arc<HealthState>>,
    pub config: OperatorConfig,
    pub members: MemberSetManager,
    pub status: StatusAggregator,
    pub backoff: BackoffConfig,
    /// Consecutive failed passes per object, keyed by namespace/name
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl Context {
    pub fn new(platform: Arc<dyn ClusterPlatform>, config: OperatorConfig) -> Self {
        Self {
            platform,
            health_state: None,
            members: MemberSetManager::new(config.member_ready_timeout),
            status: StatusAggregator::new(config.unhealthy_grace_period),
            config,
            backoff: BackoffConfig::default(),
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_health_state(mut self, health_state: Option<Arc<HealthState>>) -> Self {
        self.health_state = health_state;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Count a failed pass and return how many failures preceded it
    pub fn record_failure(&self, key: &str) -> u32 {
        let Ok(mut failures) = self.failures.lock() else {
            return 0;
        };
        let count = failures.entry(key.to_string()).or_default();
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    /// Forget the failures of an object after a successful pass
    pub fn reset_failures(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }
}

