//! State machine tracking from log output
//!
//! Components under test report their state machines through log lines
//! (see [`patterns`] for the grammar). The tracker folds those lines into a
//! current-state map plus transition and blocked-event histories, and lets the
//! test runner wait for a state or transition to show up.
//!
//! A [`StateTracker`] is a cheap handle: clones share the same state, so the
//! log reader task and the runner each hold one.

mod patterns;
mod stream;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

use patterns::Matched;
pub use stream::{LineSink, LogBuffer, LogLine, LogPump};

/// Default interval between polls in the wait operations
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Kind of state machine event recognized in a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Init,
    Transition,
    State,
    Blocked,
    Ignored,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Init => "INIT",
            EventKind::Transition => "TRANSITION",
            EventKind::State => "STATE",
            EventKind::Blocked => "BLOCKED",
            EventKind::Ignored => "IGNORED",
        };
        f.write_str(s)
    }
}

/// A parsed state machine event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub timestamp: DateTime<Local>,
    pub machine: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Message body the event was parsed from, header stripped
    pub raw: String,
}

impl TransitionEvent {
    fn from_match(matched: Matched, timestamp: DateTime<Local>, raw: &str) -> Self {
        let mut event = TransitionEvent {
            timestamp,
            machine: String::new(),
            kind: EventKind::Init,
            from_state: None,
            to_state: None,
            current_state: None,
            trigger: None,
            reason: None,
            raw: raw.to_string(),
        };

        match matched {
            Matched::Init { machine, state } => {
                event.machine = machine;
                event.current_state = Some(state);
            }
            Matched::Transition {
                machine,
                from,
                to,
                trigger,
            } => {
                event.kind = EventKind::Transition;
                event.machine = machine;
                event.from_state = Some(from);
                event.to_state = Some(to);
                event.trigger = Some(trigger);
            }
            Matched::State { machine, state } => {
                event.kind = EventKind::State;
                event.machine = machine;
                event.current_state = Some(state);
            }
            Matched::Blocked {
                machine,
                trigger,
                from,
                to,
                reason,
            } => {
                event.kind = EventKind::Blocked;
                event.machine = machine;
                event.trigger = Some(trigger);
                event.from_state = Some(from);
                event.to_state = Some(to);
                event.reason = Some(reason);
            }
            Matched::Ignored {
                machine,
                trigger,
                state,
                reason,
            } => {
                event.kind = EventKind::Ignored;
                event.machine = machine;
                event.trigger = Some(trigger);
                event.current_state = Some(state);
                event.reason = Some(reason);
            }
        }
        event
    }

    /// Whether this transition went `from -> to`, optionally via `trigger`
    pub fn is_transition(&self, from: &str, to: &str, trigger: Option<&str>) -> bool {
        self.kind == EventKind::Transition
            && self.from_state.as_deref() == Some(from)
            && self.to_state.as_deref() == Some(to)
            && trigger.is_none_or(|t| self.trigger.as_deref() == Some(t))
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |o: &Option<String>| o.clone().unwrap_or_default();
        match self.kind {
            EventKind::Transition => write!(
                f,
                "{} -> {} (trigger={})",
                opt(&self.from_state),
                opt(&self.to_state),
                opt(&self.trigger)
            ),
            EventKind::Blocked => write!(
                f,
                "{} -> {} blocked (trigger={}, reason={})",
                opt(&self.from_state),
                opt(&self.to_state),
                opt(&self.trigger),
                opt(&self.reason)
            ),
            EventKind::Ignored => write!(
                f,
                "{} ignored in {} (reason={})",
                opt(&self.trigger),
                opt(&self.current_state),
                opt(&self.reason)
            ),
            EventKind::Init | EventKind::State => {
                write!(f, "{} {}", self.kind, opt(&self.current_state))
            }
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    current: HashMap<String, String>,
    transitions: Vec<TransitionEvent>,
    blocked: Vec<TransitionEvent>,
}

/// Shared state machine tracker
#[derive(Debug, Clone)]
pub struct StateTracker {
    inner: Arc<Mutex<TrackerState>>,
    poll_interval: Duration,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerState::default())),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Use a different poll interval for the wait operations
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Parse one log line and apply it
    ///
    /// The event timestamp is `timestamp` if given, else the glog header
    /// time, else now. Returns `None` for lines that are not state machine
    /// events.
    pub fn process_line(
        &self,
        line: &str,
        timestamp: Option<DateTime<Local>>,
    ) -> Option<TransitionEvent> {
        let (header_time, body) = patterns::strip_header(line);
        let matched = patterns::match_event(body)?;
        let timestamp = timestamp.or(header_time).unwrap_or_else(Local::now);
        let event = TransitionEvent::from_match(matched, timestamp, body);

        {
            let mut state = self.lock();
            match event.kind {
                EventKind::Init | EventKind::State => {
                    if let Some(s) = &event.current_state {
                        state.current.insert(event.machine.clone(), s.clone());
                    }
                }
                EventKind::Transition => {
                    if let Some(to) = &event.to_state {
                        state.current.insert(event.machine.clone(), to.clone());
                    }
                    state.transitions.push(event.clone());
                }
                EventKind::Blocked => state.blocked.push(event.clone()),
                EventKind::Ignored => {}
            }
        }

        tracing::debug!(
            machine = %event.machine,
            kind = %event.kind,
            "State machine event: {}",
            event
        );
        Some(event)
    }

    pub fn current_state(&self, machine: &str) -> Option<String> {
        self.lock().current.get(machine).cloned()
    }

    /// Current state of every machine seen so far
    pub fn all_states(&self) -> BTreeMap<String, String> {
        self.lock()
            .current
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Names of every machine with a known state, sorted
    pub fn machines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().current.keys().cloned().collect();
        names.sort();
        names
    }

    /// Transition history, optionally for one machine
    pub fn transitions(&self, machine: Option<&str>) -> Vec<TransitionEvent> {
        filtered(&self.lock().transitions, machine)
    }

    /// Blocked transition attempts, optionally for one machine
    pub fn blocked_events(&self, machine: Option<&str>) -> Vec<TransitionEvent> {
        filtered(&self.lock().blocked, machine)
    }

    pub fn last_transition(&self, machine: &str) -> Option<TransitionEvent> {
        self.lock()
            .transitions
            .iter()
            .rev()
            .find(|t| t.machine == machine)
            .cloned()
    }

    /// Poll until `machine` is in `expected` or `timeout` elapses
    pub async fn wait_for_state(&self, machine: &str, expected: &str, timeout: Duration) -> bool {
        self.poll_until(timeout, || {
            self.lock().current.get(machine).map(String::as_str) == Some(expected)
        })
        .await
    }

    /// Poll until a matching transition is in the history or `timeout` elapses
    ///
    /// Transitions recorded before the call count.
    pub async fn wait_for_transition(
        &self,
        machine: &str,
        from: &str,
        to: &str,
        trigger: Option<&str>,
        timeout: Duration,
    ) -> bool {
        self.poll_until(timeout, || {
            self.lock()
                .transitions
                .iter()
                .any(|t| t.machine == machine && t.is_transition(from, to, trigger))
        })
        .await
    }

    /// Check that the last transitions of `machine` are exactly `expected`
    pub fn verify_transition_sequence(&self, machine: &str, expected: &[(&str, &str)]) -> bool {
        let history = self.transitions(Some(machine));
        if history.len() < expected.len() {
            return false;
        }
        history[history.len() - expected.len()..]
            .iter()
            .zip(expected)
            .all(|(t, (from, to))| {
                t.from_state.as_deref() == Some(*from) && t.to_state.as_deref() == Some(*to)
            })
    }

    /// Forget all states and history
    pub fn clear(&self) {
        let mut state = self.lock();
        state.current.clear();
        state.transitions.clear();
        state.blocked.clear();
    }

    /// The check runs at least once; the lock is never held across a sleep
    async fn poll_until(&self, timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }
}

fn filtered(events: &[TransitionEvent], machine: Option<&str>) -> Vec<TransitionEvent> {
    events
        .iter()
        .filter(|e| machine.is_none_or(|m| e.machine == m))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIMATE_LOG: &[&str] = &[
        "[SM:ClimateControl] INIT: state=OFF",
        "[SM:ClimateControl] TRANSITION: OFF -> IDLE | trigger=power_on",
        "[SM:ClimateControl] TRANSITION: IDLE -> COOLING | trigger=start_cooling",
        "[SM:ClimateControl] TRANSITION: COOLING -> IDLE | trigger=temperature_reached",
    ];

    fn climate_tracker() -> StateTracker {
        let tracker = StateTracker::new().with_poll_interval(Duration::from_millis(10));
        for line in CLIMATE_LOG {
            assert!(tracker.process_line(line, None).is_some());
        }
        tracker
    }

    #[test]
    fn test_transition_updates_state_and_history() {
        let tracker = climate_tracker();
        assert_eq!(tracker.current_state("ClimateControl").as_deref(), Some("IDLE"));

        let history = tracker.transitions(Some("ClimateControl"));
        assert_eq!(history.len(), 3);
        assert!(history[2].is_transition("COOLING", "IDLE", Some("temperature_reached")));
        assert_eq!(
            tracker.last_transition("ClimateControl").unwrap().trigger.as_deref(),
            Some("temperature_reached")
        );
    }

    #[test]
    fn test_reprocessing_is_not_deduplicated() {
        let tracker = StateTracker::new();
        let line = "[SM:Door] TRANSITION: CLOSED -> OPEN | trigger=unlock";
        tracker.process_line(line, None);
        tracker.process_line(line, None);
        assert_eq!(tracker.current_state("Door").as_deref(), Some("OPEN"));
        assert_eq!(tracker.transitions(Some("Door")).len(), 2);
    }

    #[test]
    fn test_blocked_and_ignored_do_not_move_state() {
        let tracker = StateTracker::new();
        tracker.process_line("[SM:Door] INIT: state=CLOSED", None);

        let blocked = tracker
            .process_line(
                "[SM:Door] BLOCKED: trigger='open' from=CLOSED to=OPEN reason=moving",
                None,
            )
            .unwrap();
        assert_eq!(blocked.kind, EventKind::Blocked);

        let ignored = tracker
            .process_line(
                "[SM:Door] IGNORED: trigger='close' state=CLOSED reason=no_transition",
                None,
            )
            .unwrap();
        assert_eq!(ignored.kind, EventKind::Ignored);

        assert_eq!(tracker.current_state("Door").as_deref(), Some("CLOSED"));
        assert_eq!(tracker.blocked_events(Some("Door")).len(), 1);
        assert!(tracker.transitions(None).is_empty());
    }

    #[test]
    fn test_unrecognized_lines_are_discarded() {
        let tracker = StateTracker::new();
        assert!(tracker.process_line("random output", None).is_none());
        assert!(tracker.all_states().is_empty());
    }

    #[test]
    fn test_filters_and_machines() {
        let tracker = climate_tracker();
        tracker.process_line("[SM:Door] STATE: current=OPEN", None);
        assert_eq!(tracker.machines(), vec!["ClimateControl", "Door"]);
        assert!(tracker.transitions(Some("Door")).is_empty());
        assert_eq!(tracker.transitions(None).len(), 3);
        assert_eq!(tracker.all_states().get("Door").map(String::as_str), Some("OPEN"));
    }

    #[test]
    fn test_verify_transition_sequence() {
        let tracker = climate_tracker();
        assert!(tracker.verify_transition_sequence(
            "ClimateControl",
            &[("IDLE", "COOLING"), ("COOLING", "IDLE")]
        ));
        assert!(!tracker.verify_transition_sequence("ClimateControl", &[("OFF", "IDLE")]));
        assert!(!tracker.verify_transition_sequence(
            "ClimateControl",
            &[("A", "B"), ("B", "C"), ("C", "D"), ("D", "E")]
        ));
    }

    #[test]
    fn test_clear() {
        let tracker = climate_tracker();
        tracker.clear();
        assert!(tracker.current_state("ClimateControl").is_none());
        assert!(tracker.transitions(None).is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_past_transition() {
        let tracker = climate_tracker();
        assert!(
            tracker
                .wait_for_transition(
                    "ClimateControl",
                    "OFF",
                    "IDLE",
                    None,
                    Duration::from_millis(50)
                )
                .await
        );
        assert!(
            !tracker
                .wait_for_transition(
                    "ClimateControl",
                    "OFF",
                    "IDLE",
                    Some("wrong_trigger"),
                    Duration::from_millis(50)
                )
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_state_sees_concurrent_update() {
        let tracker = StateTracker::new().with_poll_interval(Duration::from_millis(10));
        let writer = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.process_line("[SM:Door] STATE: current=OPEN", None);
        });

        assert!(
            tracker
                .wait_for_state("Door", "OPEN", Duration::from_secs(2))
                .await
        );
    }

    #[tokio::test]
    async fn test_wait_for_state_times_out() {
        let tracker = climate_tracker();
        let start = std::time::Instant::now();
        assert!(
            !tracker
                .wait_for_state("ClimateControl", "COOLING", Duration::from_millis(100))
                .await
        );
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
