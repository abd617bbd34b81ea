// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Boolean gates on job runnability and their wake-up observers.
//!
//! A constraint is a named predicate over runtime state; a job declaring
//! several constraints is runnable only when all of them hold. Observers
//! subscribe to the underlying state flags and wake the scheduler when a
//! predicate may have flipped. They never run jobs themselves.

use std::{collections::HashMap, sync::Arc};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::scheduler::SchedulerHandle;

pub mod keys {
    pub const NETWORK: &str = "network";
    pub const STORAGE_UNLOCKED: &str = "storage-unlocked";
    pub const NOT_IN_CALL: &str = "not-in-call";
    pub const CHARGING: &str = "charging";
    pub const DATA_RESTORE_IDLE: &str = "data-restore-idle";
}

pub trait Constraint: Send + Sync {
    fn key(&self) -> &'static str;

    fn is_met(&self) -> bool;
}

#[derive(Default)]
pub struct ConstraintRegistry {
    constraints: HashMap<&'static str, Arc<dyn Constraint>>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, constraint: Arc<dyn Constraint>) {
        self.constraints.insert(constraint.key(), constraint);
    }

    /// AND semantics over the declared keys.
    ///
    /// An unknown key evaluates to unmet: the job stays pending instead of
    /// running without its gate.
    pub fn are_met(&self, keys: &[String]) -> bool {
        keys.iter().all(|key| match self.constraints.get(key.as_str()) {
            Some(constraint) => constraint.is_met(),
            None => {
                warn!(key, "job declares unknown constraint; treating as unmet");
                false
            }
        })
    }
}

/// A watchable boolean cell backing a constraint.
#[derive(Debug, Clone)]
pub struct StateFlag {
    tx: watch::Sender<bool>,
}

impl StateFlag {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, value: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != value;
            *current = value;
            changed
        });
    }

    pub fn get(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// A constraint backed by a state flag.
///
/// `met_when` inverts the flag where the predicate is the negation of the
/// signal (e.g. "not mid-call" over an "in call" flag).
struct FlagConstraint {
    key: &'static str,
    flag: StateFlag,
    met_when: bool,
}

impl Constraint for FlagConstraint {
    fn key(&self) -> &'static str {
        self.key
    }

    fn is_met(&self) -> bool {
        self.flag.get() == self.met_when
    }
}

/// The runtime/environment signals the engine observes.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub network_available: StateFlag,
    pub storage_unlocked: StateFlag,
    pub in_call: StateFlag,
    pub charging: StateFlag,
    pub data_restore_in_progress: StateFlag,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            network_available: StateFlag::new(true),
            storage_unlocked: StateFlag::new(true),
            in_call: StateFlag::new(false),
            charging: StateFlag::new(false),
            data_restore_in_progress: StateFlag::new(false),
        }
    }
}

impl RuntimeState {
    /// Builds the registry of all standard constraints over this state.
    pub fn registry(&self) -> ConstraintRegistry {
        let mut registry = ConstraintRegistry::new();
        registry.register(Arc::new(FlagConstraint {
            key: keys::NETWORK,
            flag: self.network_available.clone(),
            met_when: true,
        }));
        registry.register(Arc::new(FlagConstraint {
            key: keys::STORAGE_UNLOCKED,
            flag: self.storage_unlocked.clone(),
            met_when: true,
        }));
        registry.register(Arc::new(FlagConstraint {
            key: keys::NOT_IN_CALL,
            flag: self.in_call.clone(),
            met_when: false,
        }));
        registry.register(Arc::new(FlagConstraint {
            key: keys::CHARGING,
            flag: self.charging.clone(),
            met_when: true,
        }));
        registry.register(Arc::new(FlagConstraint {
            key: keys::DATA_RESTORE_IDLE,
            flag: self.data_restore_in_progress.clone(),
            met_when: false,
        }));
        registry
    }

    /// Spawns one observer task per flag.
    ///
    /// Each observer wakes the scheduler when its signal changes, so that
    /// constraint-gated jobs are retried without waiting for the periodic
    /// sweep. Tasks end when the flag's sender is dropped.
    pub fn spawn_observers(&self, handle: SchedulerHandle) -> Vec<JoinHandle<()>> {
        [
            ("network", self.network_available.subscribe()),
            ("storage-unlocked", self.storage_unlocked.subscribe()),
            ("in-call", self.in_call.subscribe()),
            ("charging", self.charging.subscribe()),
            ("data-restore", self.data_restore_in_progress.subscribe()),
        ]
        .into_iter()
        .map(|(signal, mut rx)| {
            let handle = handle.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    debug!(signal, "constraint signal changed; waking scheduler");
                    handle.notify_work();
                }
            })
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn met(registry: &ConstraintRegistry, key: &str) -> bool {
        registry.are_met(&[key.to_owned()])
    }

    #[test]
    fn flags_gate_their_constraints() {
        let state = RuntimeState::default();
        let registry = state.registry();

        assert!(met(&registry, keys::NETWORK));
        state.network_available.set(false);
        assert!(!met(&registry, keys::NETWORK));

        // Inverted predicate: in a call means the constraint is unmet.
        assert!(met(&registry, keys::NOT_IN_CALL));
        state.in_call.set(true);
        assert!(!met(&registry, keys::NOT_IN_CALL));
    }

    #[test]
    fn and_semantics_over_multiple_keys() {
        let state = RuntimeState::default();
        let registry = state.registry();
        let both = [keys::NETWORK.to_owned(), keys::STORAGE_UNLOCKED.to_owned()];

        assert!(registry.are_met(&both));
        state.storage_unlocked.set(false);
        assert!(!registry.are_met(&both));
    }

    #[test]
    fn unknown_key_is_unmet() {
        let registry = RuntimeState::default().registry();
        assert!(!met(&registry, "no-such-constraint"));
    }

    #[test]
    fn no_declared_constraints_is_met() {
        let registry = RuntimeState::default().registry();
        assert!(registry.are_met(&[]));
    }
}
