use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version written to `PRAGMA user_version`.
pub const DATABASE_VERSION: i32 = 1;

/// Value hosts compare against when they still expect the integer sentinel
/// from retention pruning; see `StoreError::retention_sentinel`.
pub const RETENTION_NOT_SUPPORTED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub metric_id: String,
    pub name: String,
    pub instance_id: String,
    pub server_name: String,
    pub last_timestamp: i64,
    pub parameters: serde_json::Value,
}

impl Metric {
    pub fn new(metric_id: &str, instance_id: &str, server_name: &str) -> Self {
        Self {
            metric_id: metric_id.to_string(),
            name: metric_id.to_string(),
            instance_id: instance_id.to_string(),
            server_name: server_name.to_string(),
            last_timestamp: 0,
            parameters: serde_json::json!({}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricData {
    pub metric_id: String,
    pub timestamp: i64,
    pub metric_value: f64,
    pub anomaly_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceData {
    pub instance_id: String,
    /// Bucket width in minutes, see [`AggregationType::minutes`].
    pub aggregation: i64,
    pub timestamp: i64,
    pub anomaly_score: f64,
    pub metric_mask: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationType {
    Hour,
    Day,
    Week,
}

impl AggregationType {
    pub fn minutes(self) -> i64 {
        match self {
            Self::Hour => 5,
            Self::Day => 60,
            Self::Week => 480,
        }
    }

    pub fn from_minutes(minutes: i64) -> Option<Self> {
        match minutes {
            5 => Some(Self::Hour),
            60 => Some(Self::Day),
            480 => Some(Self::Week),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Assigned by the store on first insert.
    pub local_id: Option<i64>,
    pub notification_id: String,
    pub metric_id: String,
    pub timestamp: i64,
    pub read: bool,
    pub description: String,
}

impl Notification {
    pub fn unread(notification_id: &str, metric_id: &str, timestamp: i64, description: &str) -> Self {
        Self {
            local_id: None,
            notification_id: notification_id.to_string(),
            metric_id: metric_id.to_string(),
            timestamp,
            read: false,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub annotation_id: String,
    pub instance_id: String,
    pub timestamp: i64,
    pub created: i64,
    pub device: String,
    pub user: String,
    pub message: String,
}

impl Annotation {
    pub fn new(instance_id: &str, timestamp: i64, device: &str, user: &str, message: &str) -> Self {
        Self {
            annotation_id: Uuid::new_v4().to_string(),
            instance_id: instance_id.to_string(),
            timestamp,
            created: Utc::now().timestamp_millis(),
            device: device.to_string(),
            user: user.to_string(),
            message: message.to_string(),
        }
    }
}

/// Per-row result of a batch insert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub inserted: usize,
    pub ignored: usize,
    pub failures: Vec<RowFailure>,
}

impl BatchOutcome {
    pub fn any_inserted(&self) -> bool {
        self.inserted > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFailure {
    pub index: usize,
    pub reason: String,
}

/// What `delete_instance` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDeletion {
    pub instance_data_rows: usize,
    pub annotations: usize,
    pub metrics: Vec<String>,
}

pub fn to_epoch_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::AggregationType;

    #[test]
    fn aggregation_minutes_map_back_to_type() {
        for aggregation in [AggregationType::Hour, AggregationType::Day, AggregationType::Week] {
            assert_eq!(AggregationType::from_minutes(aggregation.minutes()), Some(aggregation));
        }
        assert_eq!(AggregationType::from_minutes(15), None);
    }
}
