// Query result snapshots and the monotonic merge of streamed table updates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data type tag of streamed query result frames.
pub const TABLE_DATA_TYPE: &str = "table";

/// Exception text recorded when the client abandons an execution.
pub const CANCELLED_MESSAGE: &str = "Cancelled.";

/// Completion percentage reserved for the terminal `done` signal.
pub const COMPLETE_PERCENT: f64 = 100.0;

/// Highest progress a data frame can report.
const DATA_PERCENT_LIMIT: f64 = 99.0;

/// The evolving outcome of executing one query.
///
/// Terminal once `exception` is set (failure) or `percent_complete` reaches
/// 100 (success). Neither state is left once entered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultSnapshot {
    pub percent_complete: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_requests: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Payload of a `table` data frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TableUpdate {
    #[serde(default)]
    pub percent_complete: f64,
    #[serde(default)]
    pub rows: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    pub column_names: Option<Vec<String>>,
    #[serde(default)]
    pub column_requests: Option<Vec<String>>,
}

impl TableUpdate {
    /// Progress carried by this update. Data frames never report completion;
    /// only the terminal `done` signal does.
    pub fn progress(&self) -> f64 {
        if !self.percent_complete.is_finite() || self.percent_complete <= 0.0 {
            return 0.0;
        }
        self.percent_complete.min(DATA_PERCENT_LIMIT)
    }
}

impl ResultSnapshot {
    /// A fresh snapshot for an execution that has just been issued.
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    pub fn is_complete(&self) -> bool {
        !self.is_failed() && self.percent_complete >= COMPLETE_PERCENT
    }

    pub fn is_terminal(&self) -> bool {
        self.is_failed() || self.is_complete()
    }

    /// Merge a streamed update. Returns whether the snapshot changed.
    ///
    /// Updates are ignored once the snapshot is terminal, and updates whose
    /// progress is lower than the stored progress are dropped whole.
    pub fn apply(&mut self, update: TableUpdate) -> bool {
        if self.is_terminal() {
            return false;
        }
        let progress = update.progress();
        if progress < self.percent_complete {
            return false;
        }

        self.percent_complete = progress;
        self.rows = update.rows;
        self.column_names = update.column_names;
        self.column_requests = update.column_requests;
        true
    }

    /// Record the terminal success signal.
    pub fn complete(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.percent_complete = COMPLETE_PERCENT;
        true
    }

    /// Record a terminal failure. The first recorded exception wins.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.exception = Some(message.into());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(percent: f64, count: i64) -> TableUpdate {
        TableUpdate {
            percent_complete: percent,
            rows: Some(vec![vec![json!(count)]]),
            column_names: Some(vec!["count".to_string()]),
            column_requests: Some(vec!["count()".to_string()]),
        }
    }

    #[test]
    fn apply_overwrites_on_equal_or_higher_progress() {
        let mut snapshot = ResultSnapshot::pending();
        assert!(snapshot.apply(update(10.0, 1)));
        assert!(snapshot.apply(update(10.0, 2)));
        assert_eq!(snapshot.rows, Some(vec![vec![json!(2)]]));
        assert!(snapshot.apply(update(55.5, 3)));
        assert_eq!(snapshot.percent_complete, 55.5);
        assert_eq!(snapshot.column_names, Some(vec!["count".to_string()]));
    }

    #[test]
    fn apply_drops_regressing_updates_whole() {
        let mut snapshot = ResultSnapshot::pending();
        snapshot.apply(update(60.0, 6));
        let before = snapshot.clone();

        assert!(!snapshot.apply(update(40.0, 4)));
        assert_eq!(snapshot, before);
    }

    #[test]
    fn fractional_regression_is_dropped() {
        let mut snapshot = ResultSnapshot::pending();
        snapshot.apply(update(55.5, 5));

        assert!(!snapshot.apply(update(55.2, 4)));
        assert_eq!(snapshot.percent_complete, 55.5);
        assert_eq!(snapshot.rows, Some(vec![vec![json!(5)]]));
    }

    #[test]
    fn data_frames_cannot_mark_completion() {
        let mut snapshot = ResultSnapshot::pending();
        snapshot.apply(update(100.0, 9));
        assert_eq!(snapshot.percent_complete, 99.0);
        assert!(!snapshot.is_terminal());

        assert!(snapshot.complete());
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.rows, Some(vec![vec![json!(9)]]));
    }

    #[test]
    fn exception_freezes_the_snapshot() {
        let mut snapshot = ResultSnapshot::pending();
        snapshot.apply(update(20.0, 2));
        assert!(snapshot.fail("division by zero"));
        let frozen = snapshot.clone();

        assert!(!snapshot.apply(update(80.0, 8)));
        assert!(!snapshot.complete());
        assert!(!snapshot.fail(CANCELLED_MESSAGE));
        assert_eq!(snapshot, frozen);
        assert_eq!(snapshot.exception.as_deref(), Some("division by zero"));
    }

    #[test]
    fn table_update_decodes_partial_payloads() {
        let decoded: TableUpdate =
            serde_json::from_value(json!({ "percentComplete": 12 })).expect("update should decode");
        assert_eq!(decoded.progress(), 12.0);
        assert!(decoded.rows.is_none());

        let negative = TableUpdate { percent_complete: -3.0, ..Default::default() };
        assert_eq!(negative.progress(), 0.0);
        let nan = TableUpdate { percent_complete: f64::NAN, ..Default::default() };
        assert_eq!(nan.progress(), 0.0);
    }

    #[test]
    fn snapshot_serializes_without_absent_fields() {
        let encoded = serde_json::to_value(ResultSnapshot::pending()).expect("should serialize");
        assert_eq!(encoded, json!({ "percentComplete": 0.0 }));
    }
}
