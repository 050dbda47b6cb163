use super::helper::{CursorRow, FieldMap, Table};
use crate::errors::{StoreError, StoreResult};
use crate::models::{Annotation, InstanceData, Metric, MetricData, Notification};
use rusqlite::types::Value;

/// Two-way mapping between a typed record and a table row.
pub trait Record: Sized {
    const TABLE: Table;
    const COLUMNS: &'static [&'static str];

    fn to_field_map(&self) -> FieldMap;

    fn from_row(row: &CursorRow) -> StoreResult<Self>;

    /// Rejects values the table cannot store faithfully.
    fn validate(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Maps caller-supplied projection names onto the table's known columns.
    fn projection(columns: Option<&[&str]>) -> StoreResult<Option<Vec<&'static str>>> {
        let Some(columns) = columns else {
            return Ok(None);
        };
        columns
            .iter()
            .map(|requested| {
                Self::COLUMNS
                    .iter()
                    .find(|known| **known == *requested)
                    .copied()
                    .ok_or_else(|| {
                        StoreError::Validation(format!(
                            "unknown column '{}' for table {}",
                            requested,
                            Self::TABLE.as_str()
                        ))
                    })
            })
            .collect::<StoreResult<Vec<_>>>()
            .map(Some)
    }
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

// SQLite binds NaN as NULL, which would turn into a skipped or defaulted row.
fn finite(table: Table, column: &str, value: f64) -> StoreResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(StoreError::Validation(format!(
            "{}.{} must be finite, got {}",
            table.as_str(),
            column,
            value
        )))
    }
}

impl Record for Metric {
    const TABLE: Table = Table::Metric;
    const COLUMNS: &'static [&'static str] = &[
        "metric_id",
        "name",
        "instance_id",
        "server_name",
        "last_timestamp",
        "parameters",
    ];

    fn to_field_map(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("metric_id", text(&self.metric_id));
        fields.insert("name", text(&self.name));
        fields.insert("instance_id", text(&self.instance_id));
        fields.insert("server_name", text(&self.server_name));
        fields.insert("last_timestamp", Value::Integer(self.last_timestamp));
        fields.insert("parameters", Value::Text(self.parameters.to_string()));
        fields
    }

    fn from_row(row: &CursorRow) -> StoreResult<Self> {
        let parameters_raw: String = row.get("parameters")?;
        Ok(Self {
            metric_id: row.get("metric_id")?,
            name: row.get("name")?,
            instance_id: row.get("instance_id")?,
            server_name: row.get("server_name")?,
            last_timestamp: row.get("last_timestamp")?,
            parameters: serde_json::from_str(&parameters_raw)?,
        })
    }
}

impl Record for MetricData {
    const TABLE: Table = Table::MetricData;
    const COLUMNS: &'static [&'static str] = &["metric_id", "timestamp", "metric_value", "anomaly_score"];

    fn to_field_map(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("metric_id", text(&self.metric_id));
        fields.insert("timestamp", Value::Integer(self.timestamp));
        fields.insert("metric_value", Value::Real(self.metric_value));
        fields.insert("anomaly_score", Value::Real(self.anomaly_score));
        fields
    }

    fn from_row(row: &CursorRow) -> StoreResult<Self> {
        Ok(Self {
            metric_id: row.get("metric_id")?,
            timestamp: row.get("timestamp")?,
            metric_value: row.get("metric_value")?,
            anomaly_score: row.get("anomaly_score")?,
        })
    }

    fn validate(&self) -> StoreResult<()> {
        finite(Self::TABLE, "metric_value", self.metric_value)?;
        finite(Self::TABLE, "anomaly_score", self.anomaly_score)
    }
}

impl Record for InstanceData {
    const TABLE: Table = Table::InstanceData;
    const COLUMNS: &'static [&'static str] = &[
        "instance_id",
        "aggregation",
        "timestamp",
        "anomaly_score",
        "metric_mask",
    ];

    fn to_field_map(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("instance_id", text(&self.instance_id));
        fields.insert("aggregation", Value::Integer(self.aggregation));
        fields.insert("timestamp", Value::Integer(self.timestamp));
        fields.insert("anomaly_score", Value::Real(self.anomaly_score));
        fields.insert("metric_mask", Value::Integer(self.metric_mask));
        fields
    }

    fn from_row(row: &CursorRow) -> StoreResult<Self> {
        Ok(Self {
            instance_id: row.get("instance_id")?,
            aggregation: row.get("aggregation")?,
            timestamp: row.get("timestamp")?,
            anomaly_score: row.get("anomaly_score")?,
            metric_mask: row.get("metric_mask")?,
        })
    }

    fn validate(&self) -> StoreResult<()> {
        finite(Self::TABLE, "anomaly_score", self.anomaly_score)
    }
}

impl Record for Notification {
    const TABLE: Table = Table::Notification;
    const COLUMNS: &'static [&'static str] = &[
        "local_id",
        "notification_id",
        "metric_id",
        "timestamp",
        "read",
        "description",
    ];

    // local_id is left out until assigned so the store can allocate it.
    fn to_field_map(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        if let Some(local_id) = self.local_id {
            fields.insert("local_id", Value::Integer(local_id));
        }
        fields.insert("notification_id", text(&self.notification_id));
        fields.insert("metric_id", text(&self.metric_id));
        fields.insert("timestamp", Value::Integer(self.timestamp));
        fields.insert("read", Value::Integer(i64::from(self.read)));
        fields.insert("description", text(&self.description));
        fields
    }

    fn from_row(row: &CursorRow) -> StoreResult<Self> {
        Ok(Self {
            local_id: Some(row.get("local_id")?),
            notification_id: row.get("notification_id")?,
            metric_id: row.get("metric_id")?,
            timestamp: row.get("timestamp")?,
            read: row.get("read")?,
            description: row.get("description")?,
        })
    }
}

impl Record for Annotation {
    const TABLE: Table = Table::Annotation;
    const COLUMNS: &'static [&'static str] = &[
        "annotation_id",
        "instance_id",
        "timestamp",
        "created",
        "device",
        "user",
        "message",
    ];

    fn to_field_map(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("annotation_id", text(&self.annotation_id));
        fields.insert("instance_id", text(&self.instance_id));
        fields.insert("timestamp", Value::Integer(self.timestamp));
        fields.insert("created", Value::Integer(self.created));
        fields.insert("device", text(&self.device));
        fields.insert("user", text(&self.user));
        fields.insert("message", text(&self.message));
        fields
    }

    fn from_row(row: &CursorRow) -> StoreResult<Self> {
        Ok(Self {
            annotation_id: row.get("annotation_id")?,
            instance_id: row.get("instance_id")?,
            timestamp: row.get("timestamp")?,
            created: row.get("created")?,
            device: row.get("device")?,
            user: row.get("user")?,
            message: row.get("message")?,
        })
    }
}
