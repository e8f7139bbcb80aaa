//! Mutable per-run state: the timer wheel and the per-variable,
//! per-measurer, per-effector tables. Created at run start, dropped when
//! the run ends.

use crate::types::{MachineSpec, Millis};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// A pending scheduler event. Variant order is the tie-break order for
/// events sharing a timestamp: measurers fire before effectors, effectors
/// before the stage-end marker, and same-kind events fire in key order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerEvent {
    Measure(String),
    Effect(String),
    StageEnd,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerEntry {
    pub at_ms: Millis,
    pub event: TimerEvent,
}

/// Min-heap of pending events ordered by `(timestamp, kind, key)`.
#[derive(Debug, Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<TimerEntry>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at_ms: Millis, event: TimerEvent) {
        self.heap.push(Reverse(TimerEntry { at_ms, event }));
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.heap.peek().map(|Reverse(entry)| entry.at_ms)
    }

    /// Pop every event scheduled at or before `tick`, in tie-break order.
    pub fn pop_due(&mut self, tick: Millis) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.at_ms <= tick)
        {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.event);
            }
        }
        due
    }

    /// Whether a measurer/effector event is already pending.
    pub fn is_scheduled(&self, event: &TimerEvent) -> bool {
        self.heap.iter().any(|Reverse(entry)| &entry.event == event)
    }

    /// Keep only the events the predicate accepts. Used at stage entry to
    /// carry live measurer/effector phases across the boundary.
    pub fn retain(&mut self, keep: impl Fn(&TimerEvent) -> bool) {
        let entries: Vec<Reverse<TimerEntry>> = std::mem::take(&mut self.heap).into_vec();
        self.heap = entries
            .into_iter()
            .filter(|Reverse(entry)| keep(&entry.event))
            .collect();
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Fused state of one variable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariableState {
    /// `None` until the first measurement lands.
    pub value: Option<f64>,
    pub target: Option<i64>,
    /// Active measurer keys feeding this variable in the current stage.
    pub feeders: Vec<String>,
}

/// Last raw reading of one measurer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeasurerState {
    pub last: Option<i64>,
}

/// Accumulated PID terms for one effector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PidState {
    pub integral: f64,
    pub prev_error: Option<f64>,
    pub prev_eval_ms: Option<Millis>,
}

/// Everything a run mutates.
#[derive(Debug, Default)]
pub struct RunState {
    pub wheel: TimerWheel,
    pub variables: BTreeMap<String, VariableState>,
    pub measurers: BTreeMap<String, MeasurerState>,
    pub pid: BTreeMap<String, PidState>,
    /// Timestamp of the last driver write per effector, for
    /// `minChangeDelayMS` enforcement.
    pub last_write_ms: BTreeMap<String, Millis>,
    /// Timestamp of the tick currently being processed.
    pub step_ms: Millis,
}

impl RunState {
    /// Fresh state for a run, with targets seeded from `defaultTarget`.
    pub fn new(machine: &MachineSpec) -> Self {
        let variables = machine
            .variables
            .iter()
            .map(|(key, spec)| {
                (
                    key.clone(),
                    VariableState {
                        value: None,
                        target: spec.default_target,
                        feeders: Vec::new(),
                    },
                )
            })
            .collect();
        let measurers = machine
            .measurers
            .keys()
            .map(|key| (key.clone(), MeasurerState::default()))
            .collect();
        Self {
            wheel: TimerWheel::new(),
            variables,
            measurers,
            pid: BTreeMap::new(),
            last_write_ms: BTreeMap::new(),
            step_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_at_one_tick_come_out_in_kind_then_key_order() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(10, TimerEvent::StageEnd);
        wheel.schedule(10, TimerEvent::Effect("b".into()));
        wheel.schedule(10, TimerEvent::Measure("z".into()));
        wheel.schedule(10, TimerEvent::Effect("a".into()));
        wheel.schedule(10, TimerEvent::Measure("a".into()));

        assert_eq!(wheel.next_deadline(), Some(10));
        assert_eq!(
            wheel.pop_due(10),
            vec![
                TimerEvent::Measure("a".into()),
                TimerEvent::Measure("z".into()),
                TimerEvent::Effect("a".into()),
                TimerEvent::Effect("b".into()),
                TimerEvent::StageEnd,
            ]
        );
        assert!(wheel.is_empty());
    }

    #[test]
    fn pop_due_leaves_later_events_pending() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(10, TimerEvent::Measure("a".into()));
        wheel.schedule(20, TimerEvent::Measure("a".into()));
        assert_eq!(wheel.pop_due(10).len(), 1);
        assert_eq!(wheel.next_deadline(), Some(20));
    }

    #[test]
    fn retain_filters_by_event() {
        let mut wheel = TimerWheel::new();
        wheel.schedule(10, TimerEvent::Measure("keep".into()));
        wheel.schedule(20, TimerEvent::Measure("drop".into()));
        wheel.schedule(30, TimerEvent::StageEnd);
        wheel.retain(|event| matches!(event, TimerEvent::Measure(k) if k == "keep"));
        assert_eq!(wheel.pop_due(10), vec![TimerEvent::Measure("keep".into())]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn is_scheduled_sees_pending_events() {
        let mut wheel = TimerWheel::new();
        let event = TimerEvent::Effect("heater".into());
        assert!(!wheel.is_scheduled(&event));
        wheel.schedule(5, event.clone());
        assert!(wheel.is_scheduled(&event));
    }
}
