//! Task selectors: an explicit id list or a filter predicate.
//!
//! Filters arrive from administrators as query strings
//! (`state=ongoing&priority_from=0.5`). Anything that does not parse, or that
//! describes an impossible range, is rejected before any mutation happens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Task, TaskId, TaskState};

/// A filter predicate over a project's tasks. All fields are conjunctive;
/// `None` means "don't care".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<TaskId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_from: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_to: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_to: Option<DateTime<Utc>>,
    /// Percentage of required answers already collected, 0..=100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcomplete_from: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pcomplete_to: Option<f64>,
}

impl TaskFilter {
    /// Parse `key=value` pairs separated by `&`. An empty string selects
    /// every task of the project.
    pub fn parse(s: &str) -> Result<Self> {
        let mut filter = TaskFilter::default();

        for pair in s.split('&').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| {
                    Error::InvalidSelector(format!("expected key=value, got '{pair}'"))
                })?;
            let value = value.trim();

            match key.trim() {
                "state" => {
                    filter.state = Some(
                        value
                            .parse()
                            .map_err(|_| {
                                Error::InvalidSelector(format!("unknown state '{value}'"))
                            })?,
                    )
                }
                "exported" => filter.exported = Some(parse_bool(value)?),
                "priority_from" => filter.priority_from = Some(parse_number(key, value)?),
                "priority_to" => filter.priority_to = Some(parse_number(key, value)?),
                "created_from" => filter.created_from = Some(parse_time(key, value)?),
                "created_to" => filter.created_to = Some(parse_time(key, value)?),
                "pcomplete_from" => filter.pcomplete_from = Some(parse_number(key, value)?),
                "pcomplete_to" => filter.pcomplete_to = Some(parse_number(key, value)?),
                other => {
                    return Err(Error::InvalidSelector(format!("unknown filter key '{other}'")))
                }
            }
        }

        filter.validate()?;
        Ok(filter)
    }

    /// Reject inverted or out-of-domain ranges.
    pub fn validate(&self) -> Result<()> {
        check_range("priority", self.priority_from, self.priority_to)?;
        check_range("pcomplete", self.pcomplete_from, self.pcomplete_to)?;
        for pct in [self.pcomplete_from, self.pcomplete_to].into_iter().flatten() {
            if !(0.0..=100.0).contains(&pct) {
                return Err(Error::InvalidSelector(format!(
                    "pcomplete {pct} outside 0..=100"
                )));
            }
        }
        if let (Some(from), Some(to)) = (self.created_from, self.created_to) {
            if from > to {
                return Err(Error::InvalidSelector(
                    "created_from is after created_to".to_string(),
                ));
            }
        }
        if matches!(self.ids, Some(ref ids) if ids.is_empty()) {
            return Err(Error::InvalidSelector("empty id list".to_string()));
        }
        Ok(())
    }

    /// Evaluate against a task and its recorded answer count.
    pub fn matches(&self, task: &Task, recorded: u32) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.contains(&task.id) {
                return false;
            }
        }
        if self.state.is_some_and(|s| s != task.state) {
            return false;
        }
        if self.exported.is_some_and(|e| e != task.exported) {
            return false;
        }
        if self.priority_from.is_some_and(|p| task.priority < p)
            || self.priority_to.is_some_and(|p| task.priority > p)
        {
            return false;
        }
        if self.created_from.is_some_and(|t| task.created_at < t)
            || self.created_to.is_some_and(|t| task.created_at > t)
        {
            return false;
        }
        let pct = f64::from(recorded) / f64::from(task.n_answers.max(1)) * 100.0;
        if self.pcomplete_from.is_some_and(|p| pct < p)
            || self.pcomplete_to.is_some_and(|p| pct > p)
        {
            return false;
        }
        true
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::InvalidSelector(format!("expected boolean, got '{value}'"))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::InvalidSelector(format!("{key}: expected number, got '{value}'")))
}

fn parse_time(key: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            Error::InvalidSelector(format!("{key}: expected RFC 3339 time, got '{value}'"))
        })
}

fn check_range(name: &str, from: Option<f64>, to: Option<f64>) -> Result<()> {
    match (from, to) {
        (Some(a), Some(b)) if a > b => Err(Error::InvalidSelector(format!(
            "{name}_from {a} is greater than {name}_to {b}"
        ))),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Which tasks a bulk mutation targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Selector {
    Ids(Vec<TaskId>),
    Filter(TaskFilter),
}

impl Selector {
    /// Every task of the project.
    pub fn all() -> Self {
        Selector::Filter(TaskFilter::default())
    }

    pub fn ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Selector::Ids(ids.into_iter().map(TaskId).collect())
    }

    /// Length of an explicit id list; `None` for predicates.
    pub fn explicit_len(&self) -> Option<u64> {
        match self {
            Selector::Ids(ids) => Some(ids.len() as u64),
            Selector::Filter(_) => None,
        }
    }

    pub fn to_filter(&self) -> TaskFilter {
        match self {
            Selector::Ids(ids) => TaskFilter {
                ids: Some(ids.clone()),
                ..TaskFilter::default()
            },
            Selector::Filter(f) => f.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Selector::Ids(ids) if ids.is_empty() => {
                Err(Error::InvalidSelector("empty id list".to_string()))
            }
            Selector::Ids(_) => Ok(()),
            Selector::Filter(f) => f.validate(),
        }
    }
}
