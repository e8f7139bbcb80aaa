//! String-keyed handles to the host's measurement and actuation callables.
//!
//! The registry is opaque to validation except for key membership; the
//! scheduler invokes handles synchronously on the loop thread. Drivers
//! must not block indefinitely — a hung driver hangs the loop, and the
//! external watchdog owns that failure mode.

use crate::error::ProcessError;
use std::collections::BTreeMap;

pub type MeasureFn = Box<dyn FnMut() -> i64 + Send>;
pub type EffectFn = Box<dyn FnMut(i64) + Send>;

pub enum Driver {
    Measure(MeasureFn),
    Effect(EffectFn),
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Driver::Measure(_) => f.write_str("Driver::Measure"),
            Driver::Effect(_) => f.write_str("Driver::Effect"),
        }
    }
}

/// The injected driver mapping `{ driverKey: handle }`.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    handles: BTreeMap<String, Driver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, driver: Driver) {
        self.handles.insert(key.into(), driver);
    }

    pub fn add_measure(
        &mut self,
        key: impl Into<String>,
        f: impl FnMut() -> i64 + Send + 'static,
    ) {
        self.register(key, Driver::Measure(Box::new(f)));
    }

    pub fn add_effect(&mut self, key: impl Into<String>, f: impl FnMut(i64) + Send + 'static) {
        self.register(key, Driver::Effect(Box::new(f)));
    }

    /// Membership test — all the validator is allowed to know.
    pub fn contains(&self, key: &str) -> bool {
        self.handles.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(String::as_str)
    }

    /// Poll a measurement handle.
    pub fn measure(&mut self, key: &str) -> Result<i64, ProcessError> {
        match self.handles.get_mut(key) {
            Some(Driver::Measure(f)) => Ok(f()),
            Some(Driver::Effect(_)) => Err(ProcessError::DriverKind {
                key: key.to_string(),
                wanted: "measurement",
            }),
            None => Err(ProcessError::UnknownDriver(key.to_string())),
        }
    }

    /// Write a value to an actuation handle.
    pub fn effect(&mut self, key: &str, value: i64) -> Result<(), ProcessError> {
        match self.handles.get_mut(key) {
            Some(Driver::Effect(f)) => {
                f(value);
                Ok(())
            }
            Some(Driver::Measure(_)) => Err(ProcessError::DriverKind {
                key: key.to_string(),
                wanted: "actuation",
            }),
            None => Err(ProcessError::UnknownDriver(key.to_string())),
        }
    }
}
