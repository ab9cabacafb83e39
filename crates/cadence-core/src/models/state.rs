//! Execution state machine.
//!
//! A `State` is the current `StateType` plus the append-only history of every
//! transition. Duration and end date are derived from the history and only
//! exist once the state is terminal.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Created,
    Queued,
    Running,
    Paused,
    Restarted,
    Killing,
    Success,
    Warning,
    Failed,
    Killed,
    Cancelled,
}

impl StateType {
    pub const TERMINAL: [StateType; 5] = [
        Self::Success,
        Self::Warning,
        Self::Failed,
        Self::Killed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Restarted => "RESTARTED",
            Self::Killing => "KILLING",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "CREATED" => Some(Self::Created),
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "RESTARTED" => Some(Self::Restarted),
            "KILLING" => Some(Self::Killing),
            "SUCCESS" => Some(Self::Success),
            "WARNING" => Some(Self::Warning),
            "FAILED" => Some(Self::Failed),
            "KILLED" => Some(Self::Killed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistory {
    pub state: StateType,
    pub date: DateTime<Utc>,
}

/// Current state plus its full history.
///
/// Invariants: `histories` is never empty and `current` always equals the
/// state of the last entry. Both are enforced on deserialization too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "StateRecord")]
pub struct State {
    current: StateType,
    histories: Vec<StateHistory>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateRecord {
    current: StateType,
    histories: Vec<StateHistory>,
}

impl TryFrom<StateRecord> for State {
    type Error = String;

    fn try_from(record: StateRecord) -> Result<Self, Self::Error> {
        let last = record
            .histories
            .last()
            .ok_or_else(|| "state history must not be empty".to_string())?;
        if last.state != record.current {
            return Err(format!(
                "current state {} does not match last history entry {}",
                record.current, last.state
            ));
        }
        if record.histories.windows(2).any(|w| w[1].date < w[0].date) {
            return Err("state history dates must be non-decreasing".to_string());
        }
        Ok(Self {
            current: record.current,
            histories: record.histories,
        })
    }
}

impl State {
    /// A fresh `CREATED` state.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current: StateType::Created,
            histories: vec![StateHistory {
                state: StateType::Created,
                date: now,
            }],
        }
    }

    /// Rebuild a state from a stored history, validating its invariants.
    pub fn from_histories(histories: Vec<StateHistory>) -> Result<Self, String> {
        let current = histories
            .last()
            .map(|h| h.state)
            .ok_or_else(|| "state history must not be empty".to_string())?;
        Self::try_from(StateRecord { current, histories })
    }

    pub fn current(&self) -> StateType {
        self.current
    }

    pub fn histories(&self) -> &[StateHistory] {
        &self.histories
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Append a transition.
    ///
    /// Terminal states are final: the call fails with `IllegalTransition`
    /// and leaves the state untouched. A `now` older than the last entry is
    /// clamped to it so the history stays ordered.
    pub fn transition(&mut self, to: StateType, now: DateTime<Utc>) -> Result<(), OrchestrationError> {
        if self.is_terminal() {
            return Err(OrchestrationError::IllegalTransition {
                from: self.current,
                to,
            });
        }
        let date = now.max(self.last_date());
        self.histories.push(StateHistory { state: to, date });
        self.current = to;
        Ok(())
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.histories[0].date
    }

    fn last_date(&self) -> DateTime<Utc> {
        self.histories[self.histories.len() - 1].date
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.is_terminal().then(|| self.last_date())
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end_date().map(|end| end - self.start_date())
    }

    /// Two-part sort key: non-terminal states (no duration) order before
    /// every terminal one, then terminal states order by duration.
    pub fn duration_sort_key(&self) -> (bool, Option<Duration>) {
        (self.is_terminal(), self.duration())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Asc),
            "desc" | "descending" => Some(Self::Desc),
            _ => None,
        }
    }

    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            Self::Asc => ordering,
            Self::Desc => ordering.reverse(),
        }
    }
}

/// Sort anything carrying a `State` by duration, absent duration smallest.
pub fn sort_by_duration<T, F>(items: &mut [T], order: SortOrder, state_of: F)
where
    F: Fn(&T) -> &State,
{
    items.sort_by(|a, b| {
        order.apply(
            state_of(a)
                .duration_sort_key()
                .cmp(&state_of(b).duration_sort_key()),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn state_of(steps: &[(StateType, i64)]) -> State {
        let mut s = State::new(t(0));
        for (state, at) in steps {
            s.transition(*state, t(*at)).unwrap();
        }
        s
    }

    #[test]
    fn test_new_state_is_created() {
        let s = State::new(t(0));
        assert_eq!(s.current(), StateType::Created);
        assert_eq!(s.histories().len(), 1);
        assert_eq!(s.start_date(), t(0));
        assert!(!s.is_terminal());
        assert!(s.end_date().is_none());
        assert!(s.duration().is_none());
    }

    #[test]
    fn test_history_grows_and_current_tracks_last_entry() {
        let sequences: Vec<Vec<StateType>> = vec![
            vec![StateType::Running, StateType::Success],
            vec![StateType::Queued, StateType::Running, StateType::Paused, StateType::Running, StateType::Warning],
            vec![StateType::Running, StateType::Killing, StateType::Killed],
            vec![StateType::Queued, StateType::Cancelled],
            vec![StateType::Restarted, StateType::Running],
        ];

        for seq in sequences {
            let mut s = State::new(t(0));
            let mut previous_len = s.histories().len();
            for (i, next) in seq.iter().enumerate() {
                s.transition(*next, t(i as i64 * 3)).unwrap();
                assert_eq!(s.histories().len(), previous_len + 1);
                previous_len = s.histories().len();
                assert_eq!(s.current(), s.histories().last().unwrap().state);
                assert!(s.histories().windows(2).all(|w| w[0].date <= w[1].date));
            }
        }
    }

    #[test]
    fn test_transition_from_terminal_is_rejected_without_mutation() {
        let mut s = state_of(&[(StateType::Running, 1), (StateType::Failed, 5)]);
        let before = s.clone();

        let err = s.transition(StateType::Running, t(6)).unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::IllegalTransition {
                from: StateType::Failed,
                to: StateType::Running
            }
        ));
        assert_eq!(s, before);
    }

    #[test]
    fn test_clock_skew_is_clamped() {
        let mut s = State::new(t(10));
        s.transition(StateType::Running, t(5)).unwrap();
        assert_eq!(s.histories()[1].date, t(10));
    }

    #[test]
    fn test_duration_present_iff_terminal() {
        for terminal in StateType::TERMINAL {
            let s = state_of(&[(StateType::Running, 4), (terminal, 12)]);
            assert_eq!(s.end_date(), Some(t(12)));
            assert_eq!(s.duration(), Some(Duration::seconds(12)));
        }

        let running = state_of(&[(StateType::Queued, 1), (StateType::Running, 2)]);
        assert!(running.duration().is_none());
        assert!(running.end_date().is_none());
    }

    #[test]
    fn test_sort_by_duration_orders_non_terminal_as_smallest() {
        let c = ("C", State::new(t(0)));
        let r = ("R", state_of(&[(StateType::Running, 1)]));
        let f = ("F", state_of(&[(StateType::Failed, 10)]));
        let s = (
            "S",
            state_of(&[
                (StateType::Queued, 1),
                (StateType::Running, 5),
                (StateType::Success, 20),
            ]),
        );

        let mut items = vec![s.clone(), f.clone(), r.clone(), c.clone()];
        sort_by_duration(&mut items, SortOrder::Asc, |(_, st)| st);
        let names: Vec<_> = items.iter().map(|(n, _)| *n).collect();
        assert!(names[..2].contains(&"C") && names[..2].contains(&"R"));
        assert_eq!(&names[2..], &["F", "S"]);

        let mut items = vec![c, r, f, s];
        sort_by_duration(&mut items, SortOrder::Desc, |(_, st)| st);
        let names: Vec<_> = items.iter().map(|(n, _)| *n).collect();
        assert_eq!(&names[..2], &["S", "F"]);
        assert!(names[2..].contains(&"C") && names[2..].contains(&"R"));
    }

    #[test]
    fn test_deserialization_rejects_broken_invariants() {
        let empty = r#"{"current":"CREATED","histories":[]}"#;
        assert!(serde_json::from_str::<State>(empty).is_err());

        let mismatched = r#"{"current":"RUNNING","histories":[{"state":"CREATED","date":"2024-01-01T00:00:00Z"}]}"#;
        assert!(serde_json::from_str::<State>(mismatched).is_err());

        let ok = serde_json::to_string(&state_of(&[(StateType::Running, 1)])).unwrap();
        let parsed: State = serde_json::from_str(&ok).unwrap();
        assert_eq!(parsed.current(), StateType::Running);
    }

    #[test]
    fn test_state_type_string_roundtrip() {
        assert_eq!(StateType::from_str("cancelled"), Some(StateType::Cancelled));
        assert_eq!(StateType::from_str("nope"), None);
        assert!(StateType::Warning.is_terminal());
        assert!(!StateType::Killing.is_terminal());
    }
}
