//! A simulated machine for bench runs and tests.
//!
//! Each simulated variable follows a first-order response: it relaxes
//! toward its ambient set point at a rate set by `drift`, while every
//! engaged effector adds a constant delta per second. Handles produced
//! here plug straight into a [`DriverRegistry`].

use crate::drivers::DriverRegistry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

struct Inner {
    value: f64,
    set_point: f64,
    drift: f64,
    effector_delta: f64,
    last_update: Instant,
}

/// One simulated physical quantity, shareable across driver handles.
#[derive(Clone)]
pub struct SimVariable {
    inner: Arc<Mutex<Inner>>,
}

impl SimVariable {
    /// `drift` in (0, 1): the per-second fraction of the gap to the set
    /// point that remains after relaxation. Closer to 0 means faster pull.
    pub fn new(value: f64, set_point: f64, drift: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value,
                set_point,
                drift,
                effector_delta: 0.0,
                last_update: Instant::now(),
            })),
        }
    }

    fn advance(inner: &mut Inner) {
        let dt = inner.last_update.elapsed().as_secs_f64();
        if dt <= 0.0 {
            return;
        }
        let pushed = inner.value + dt * inner.effector_delta;
        let pull = (inner.set_point - pushed) * (1.0 - inner.drift.powf(dt));
        inner.value = pushed + pull;
        inner.last_update = Instant::now();
    }

    /// Current value, advanced to now and rounded for the wire.
    pub fn read(&self) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        Self::advance(&mut inner);
        inner.value.round() as i64
    }

    pub fn value(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        Self::advance(&mut inner);
        inner.value
    }

    /// A measurement handle for the registry.
    pub fn measure_handle(&self) -> impl FnMut() -> i64 + Send + 'static {
        let variable = self.clone();
        move || variable.read()
    }

    /// A binary actuation handle: a positive write engages the effector
    /// (adding `delta` per second), zero or below disengages it.
    pub fn effect_handle(&self, delta: f64) -> impl FnMut(i64) + Send + 'static {
        let variable = self.clone();
        let mut engaged = false;
        move |value| {
            let on = value > 0;
            if on == engaged {
                return;
            }
            let mut inner = variable.inner.lock().unwrap();
            Self::advance(&mut inner);
            if on {
                inner.effector_delta += delta;
            } else {
                inner.effector_delta -= delta;
            }
            engaged = on;
        }
    }
}

/// A set of simulated variables plus the registry wired to them.
#[derive(Default)]
pub struct SimRig {
    variables: BTreeMap<String, SimVariable>,
    drivers: DriverRegistry,
}

impl SimRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(
        &mut self,
        name: impl Into<String>,
        value: f64,
        set_point: f64,
        drift: f64,
    ) -> SimVariable {
        let variable = SimVariable::new(value, set_point, drift);
        self.variables.insert(name.into(), variable.clone());
        variable
    }

    pub fn variable(&self, name: &str) -> Option<SimVariable> {
        self.variables.get(name).cloned()
    }

    /// Register a measurement driver polling the named variable.
    pub fn wire_measurer(&mut self, driver_key: impl Into<String>, variable: &str) {
        if let Some(var) = self.variables.get(variable) {
            self.drivers.register(
                driver_key.into(),
                crate::drivers::Driver::Measure(Box::new(var.measure_handle())),
            );
        }
    }

    /// Register an actuation driver pushing the named variable.
    pub fn wire_effector(&mut self, driver_key: impl Into<String>, variable: &str, delta: f64) {
        if let Some(var) = self.variables.get(variable) {
            self.drivers.register(
                driver_key.into(),
                crate::drivers::Driver::Effect(Box::new(var.effect_handle(delta))),
            );
        }
    }

    /// Register an actuation driver that only records its writes in the
    /// log — for effectors with no simulated physics behind them.
    pub fn wire_logger(&mut self, driver_key: impl Into<String>) {
        let key = driver_key.into();
        let label = key.clone();
        self.drivers.add_effect(key, move |value| {
            tracing::debug!(driver = %label, value, "effector write");
        });
    }

    pub fn into_registry(self) -> DriverRegistry {
        self.drivers
    }
}
