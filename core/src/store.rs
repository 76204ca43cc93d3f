//! Parameter Store (spec §4.B): thread-safe serial -> `ParameterSet` map,
//! a default set, and a bounded change log. Uses `std::sync::RwLock` for the
//! many-reader/one-writer discipline the hot "did parameters change" check
//! needs — the primitive already provides shared reads without writer
//! starvation, so no third-party lock is required.

use crate::error::ParameterError;
use crate::types::{ParameterSet, ParameterValue};
use chrono::{DateTime, Utc};
use ringbuffer::{AllocRingBuffer, RingBuffer};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// One recorded successful `set` (spec §4.B: "logs (timestamp, serial,
/// field, old, new, source)").
#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub timestamp: DateTime<Utc>,
    pub serial: String,
    pub field: String,
    pub old: String,
    pub new: String,
    pub source: String,
}

type ChangeListener = Box<dyn Fn(&ChangeLogEntry) + Send + Sync>;

/// Thread-safe map from serial to `ParameterSet`, the default set, and a
/// 100-entry ring-buffered change log.
pub struct ParameterStore {
    default: RwLock<ParameterSet>,
    overrides: RwLock<HashMap<String, ParameterSet>>,
    change_log: Mutex<AllocRingBuffer<ChangeLogEntry>>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl ParameterStore {
    pub fn new(default: ParameterSet) -> Self {
        Self {
            default: RwLock::new(default),
            overrides: RwLock::new(HashMap::new()),
            change_log: Mutex::new(AllocRingBuffer::new(100)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Seed a camera's parameter set without going through `set` (used at
    /// configuration load, not a logged change).
    pub fn seed(&self, serial: &str, params: ParameterSet) {
        self.overrides.write().expect("parameter store poisoned").insert(serial.to_string(), params);
    }

    /// The singleton Default Parameter Set (spec §3/§6.2 get-defaults).
    pub fn default_params(&self) -> ParameterSet {
        self.default.read().expect("parameter store poisoned").clone()
    }

    /// Replace the singleton Default Parameter Set (spec §6.2 set-defaults).
    /// Cameras with no per-serial override pick this up on their next `get`.
    pub fn set_default_params(&self, params: ParameterSet) {
        *self.default.write().expect("parameter store poisoned") = params;
    }

    /// Current parameter set for `serial`, falling back to the default if
    /// the serial has never been seeded or set.
    pub fn get(&self, serial: &str) -> ParameterSet {
        let overrides = self.overrides.read().expect("parameter store poisoned");
        match overrides.get(serial) {
            Some(p) => p.clone(),
            None => self.default.read().expect("parameter store poisoned").clone(),
        }
    }

    /// Validate a value for `field` without applying it (spec §4.B
    /// `validate`).
    pub fn validate(&self, field: &str, value: &ParameterValue) -> Result<(), ParameterError> {
        crate::types::validate(field, value)
    }

    /// Set a single named field on `serial`'s parameter set, logging the
    /// change on success. Listeners fire after the write lock is released.
    /// A value identical to the one already stored is a no-op: nothing is
    /// re-inserted, no change-log entry is appended, and no listener fires
    /// (spec §8: "two successive identical set-parameter calls produce
    /// identical Parameter Store state and exactly one change-log entry").
    pub fn set(
        &self,
        serial: &str,
        field: &str,
        value: ParameterValue,
        source: &str,
    ) -> Result<ParameterSet, ParameterError> {
        let old_params = self.get(serial);
        let old_repr = field_repr(&old_params, field);

        let mut new_params = old_params;
        new_params.set_validated(field, value)?;

        let new_repr = field_repr(&new_params, field);
        if new_repr == old_repr {
            return Ok(new_params);
        }

        {
            let mut overrides = self.overrides.write().expect("parameter store poisoned");
            overrides.insert(serial.to_string(), new_params.clone());
        }

        let entry = ChangeLogEntry {
            timestamp: Utc::now(),
            serial: serial.to_string(),
            field: field.to_string(),
            old: old_repr,
            new: new_repr,
            source: source.to_string(),
        };
        self.change_log.lock().expect("change log poisoned").push(entry.clone());

        for listener in self.listeners.lock().expect("listeners poisoned").iter() {
            listener(&entry);
        }

        Ok(new_params)
    }

    /// Atomically replace `serial`'s whole parameter set (spec §4.B
    /// `set_bulk`). Every field is validated before the replacement is
    /// committed; on failure nothing changes.
    pub fn set_bulk(&self, serial: &str, params: ParameterSet) -> Result<(), ParameterError> {
        use crate::types::ParameterValue as V;
        crate::types::validate("exposure_time_us", &V::Int(params.exposure_time_us))?;
        crate::types::validate("gain", &V::Float(params.gain))?;
        crate::types::validate("black_level", &V::Int(params.black_level))?;
        crate::types::validate("red_balance", &V::Float(params.red_balance))?;
        crate::types::validate("blue_balance", &V::Float(params.blue_balance))?;

        self.overrides
            .write()
            .expect("parameter store poisoned")
            .insert(serial.to_string(), params);
        Ok(())
    }

    /// Desperate-retry variant of `set_bulk` (spec §4.F): `exposure_time_us`
    /// and `gain` may exceed the nominal ceiling up to the desperate one;
    /// every other field still validates at its nominal bound. Not part of
    /// the external API surface (spec §6.2's `set-parameters` goes through
    /// `set_bulk`) — only the retry engine's forced writes use this path.
    pub fn set_bulk_desperate(&self, serial: &str, params: ParameterSet) -> Result<(), ParameterError> {
        use crate::types::{validate_desperate, ParameterValue as V};
        validate_desperate("exposure_time_us", &V::Int(params.exposure_time_us))?;
        validate_desperate("gain", &V::Float(params.gain))?;
        validate_desperate("black_level", &V::Int(params.black_level))?;
        validate_desperate("red_balance", &V::Float(params.red_balance))?;
        validate_desperate("blue_balance", &V::Float(params.blue_balance))?;

        self.overrides
            .write()
            .expect("parameter store poisoned")
            .insert(serial.to_string(), params);
        Ok(())
    }

    /// Register a callback invoked after every successful `set`. Listeners
    /// must not call back into the store from the same thread (spec §4.B).
    pub fn register_change_listener<F>(&self, listener: F)
    where
        F: Fn(&ChangeLogEntry) + Send + Sync + 'static,
    {
        self.listeners.lock().expect("listeners poisoned").push(Box::new(listener));
    }

    /// Snapshot of the change log, oldest first.
    pub fn change_log(&self) -> Vec<ChangeLogEntry> {
        self.change_log.lock().expect("change log poisoned").iter().cloned().collect()
    }
}

fn field_repr(params: &ParameterSet, field: &str) -> String {
    match field {
        "exposure_time_us" => params.exposure_time_us.to_string(),
        "gain" => params.gain.to_string(),
        "black_level" => params.black_level.to_string(),
        "auto_exposure" => params.auto_exposure.to_string(),
        "auto_gain" => params.auto_gain.to_string(),
        "red_balance" => params.red_balance.to_string(),
        "blue_balance" => params.blue_balance.to_string(),
        other => format!("<unknown:{other}>"),
    }
}

/// Per-serial cache of the last parameter set applied to the device (spec
/// §4.B "Parameter-Cache Fast Path"). Owned by the capture pipeline, one
/// instance per worker pool, so that the dominant "unchanged" case only
/// ever takes a shared lock.
pub struct ParameterApplyCache {
    applied: RwLock<HashMap<String, ParameterSet>>,
}

impl Default for ParameterApplyCache {
    fn default() -> Self {
        Self {
            applied: RwLock::new(HashMap::new()),
        }
    }
}

impl ParameterApplyCache {
    /// Returns `true` if `current` differs from the last applied set (or
    /// none has been applied yet), meaning the device needs a reapply. On a
    /// cache miss, the cache is updated under an exclusive lock before this
    /// returns, matching the upgrade-then-release-then-apply choreography
    /// spec §4.B prescribes.
    pub fn needs_apply(&self, serial: &str, current: &ParameterSet) -> bool {
        {
            let applied = self.applied.read().expect("apply cache poisoned");
            if let Some(cached) = applied.get(serial) {
                if cached == current {
                    return false;
                }
            }
        }
        let mut applied = self.applied.write().expect("apply cache poisoned");
        applied.insert(serial.to_string(), current.clone());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_falls_back_to_default_for_unknown_serial() {
        let store = ParameterStore::new(ParameterSet::default());
        assert_eq!(store.get("unknown"), ParameterSet::default());
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = ParameterStore::new(ParameterSet::default());
        store
            .set("S1", "exposure_time_us", ParameterValue::Int(1000), "test")
            .expect("valid set");
        assert_eq!(store.get("S1").exposure_time_us, 1000);
    }

    #[test]
    fn identical_successive_sets_produce_exactly_one_log_entry() {
        let store = ParameterStore::new(ParameterSet::default());
        store.set("S1", "gain", ParameterValue::Float(2.0), "test").unwrap();
        store.set("S1", "gain", ParameterValue::Float(2.0), "test").unwrap();
        assert_eq!(store.get("S1").gain, 2.0);
        assert_eq!(store.change_log().len(), 1);
    }

    #[test]
    fn apply_cache_is_a_noop_on_unchanged_parameters() {
        let cache = ParameterApplyCache::default();
        let params = ParameterSet::default();
        assert!(cache.needs_apply("S1", &params));
        assert!(!cache.needs_apply("S1", &params));
        let mut changed = params.clone();
        changed.gain = 2.0;
        assert!(cache.needs_apply("S1", &changed));
    }

    #[test]
    fn failed_set_does_not_change_state_or_log() {
        let store = ParameterStore::new(ParameterSet::default());
        let before = store.get("S1");
        let before_log_len = store.change_log().len();
        let err = store.set("S1", "gain", ParameterValue::Float(99.0), "test");
        assert!(err.is_err());
        assert_eq!(store.get("S1"), before);
        assert_eq!(store.change_log().len(), before_log_len);
    }
}
