// Copyright (c) 2026 Safety Governor contributors
// SPDX-License-Identifier: Apache-2.0
//! Resetting governor defense.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use governor_core::domain::{
    ActionMap, Defense, Environment, EventKind, GovernorEvent, Intervention,
};
use governor_core::infrastructure::EventBus;

/// Escalation defense: listens for `Alert` events and, on the next
/// inspection with an alert pending, resets the environment.
///
/// The alert flag latches between steps, so an alert raised during
/// MONITORING takes effect on the following step's inspection.
pub struct HierarchicalGovernor {
    alert_flag: Arc<AtomicBool>,
    last_alert: Arc<parking_lot::Mutex<serde_json::Value>>,
}

impl HierarchicalGovernor {
    pub fn new(bus: &Arc<EventBus>) -> Self {
        let alert_flag = Arc::new(AtomicBool::new(false));
        let last_alert = Arc::new(parking_lot::Mutex::new(serde_json::Value::Null));
        let flag = alert_flag.clone();
        let detail = last_alert.clone();
        bus.subscribe(EventKind::Alert, move |event| {
            if let GovernorEvent::Alert {
                source,
                detail: alert_detail,
                ..
            } = event
            {
                warn!(source = %source, "alert received, arming intervention");
                *detail.lock() = alert_detail.clone();
                flag.store(true, Ordering::SeqCst);
            }
            Ok(())
        });
        Self {
            alert_flag,
            last_alert,
        }
    }
}

impl Defense for HierarchicalGovernor {
    fn name(&self) -> &str {
        "hierarchical_governor"
    }

    fn inspect(&mut self, _actions: &ActionMap, env: &mut dyn Environment) -> Vec<Intervention> {
        if !self.alert_flag.swap(false, Ordering::SeqCst) {
            return Vec::new();
        }
        let alert = std::mem::take(&mut *self.last_alert.lock());
        info!("intervening: resetting environment");
        if let Err(e) = env.reset(None) {
            warn!(error = %e, "environment reset failed during intervention");
            return vec![Intervention {
                defense: self.name().to_string(),
                action: "reset_failed".to_string(),
                detail: json!({ "error": e.to_string(), "alert": alert }),
            }];
        }
        vec![Intervention {
            defense: self.name().to_string(),
            action: "reset_environment".to_string(),
            detail: json!({ "alert": alert }),
        }]
    }
}
