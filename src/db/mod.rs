mod cache;
mod helper;
mod record;

pub use cache::{CacheState, MetadataCache};
pub use helper::{
    BatchInsert, ConflictPolicy, Cursor, CursorRow, FieldMap, Selection, SqlHelper, Statements, Table,
};
pub use record::Record;

use crate::config::StoreConfig;
use crate::errors::{StoreError, StoreResult};
use crate::models::{
    to_epoch_millis, AggregationType, Annotation, BatchOutcome, InstanceData, InstanceDeletion, Metric,
    MetricData, Notification, RowFailure, DATABASE_VERSION,
};
use chrono::{DateTime, Utc};
use rusqlite::params;
use rusqlite::types::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;
use tracing::{debug, info, warn};

const ADVANCE_LAST_TIMESTAMP_SQL: &str =
    "UPDATE metric SET last_timestamp = ?1 WHERE metric_id = ?2 AND last_timestamp < ?1";

const DELETE_INSTANCE_METRIC_DATA_SQL: &str =
    "DELETE FROM metric_data WHERE metric_id IN (SELECT metric_id FROM metric WHERE instance_id = ?1)";

#[derive(Debug)]
pub struct Database {
    sql: SqlHelper,
    cache: MetadataCache,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> StoreResult<Self> {
        Self::open(&StoreConfig {
            path: path.to_path_buf(),
            ..StoreConfig::default()
        })
    }

    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let db = Self {
            sql: SqlHelper::open(config)?,
            cache: MetadataCache::new(),
            db_path: config.path.clone(),
        };
        db.rebuild_cache()?;
        Ok(db)
    }

    pub fn version(&self) -> i32 {
        DATABASE_VERSION
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn file_name(&self) -> Option<&str> {
        self.db_path.file_name().and_then(|name| name.to_str())
    }

    /// Newest `last_timestamp` across all known metrics.
    pub fn last_timestamp(&self) -> StoreResult<Option<i64>> {
        self.ensure_cache_loaded()?;
        self.cache.max_last_timestamp()
    }

    // ─── Metadata cache ───────────────────────────────────────────────────────

    /// Full scan of the metric table. Slow on large stores; only runs on open,
    /// on explicit request, or on first use after invalidation.
    pub fn rebuild_cache(&self) -> StoreResult<usize> {
        let count = self.cache.rebuild_with(|| self.load_metrics())?;
        info!(metrics = count, "metadata cache rebuilt");
        Ok(count)
    }

    fn load_metrics(&self) -> StoreResult<Vec<Metric>> {
        self.sql
            .with_connection(|statements| statements.query_all(Table::Metric)?.into_records::<Metric>())
    }

    pub fn invalidate_cache(&self) -> StoreResult<()> {
        self.cache.invalidate()
    }

    fn ensure_cache_loaded(&self) -> StoreResult<()> {
        if !self.cache.is_loaded()? {
            self.rebuild_cache()?;
        }
        Ok(())
    }

    /// Cache guard for an operation that needs the full metric set, loaded
    /// first when the cache was invalidated.
    fn write_loaded_cache(&self) -> StoreResult<MutexGuard<'_, CacheState>> {
        let mut cache = self.cache.write()?;
        if !cache.is_loaded() {
            let count = cache.reload(|| self.load_metrics())?;
            info!(metrics = count, "metadata cache rebuilt");
        }
        Ok(cache)
    }

    // ─── Metrics ──────────────────────────────────────────────────────────────

    /// Inserts or fully replaces the metric, `last_timestamp` included.
    pub fn add_metric(&self, metric: &Metric) -> StoreResult<i64> {
        let mut cache = self.cache.write()?;
        let row_id = self.sql.with_transaction(|statements| {
            statements
                .insert(Table::Metric, &metric.to_field_map(), ConflictPolicy::Replace)?
                .ok_or_else(|| StoreError::Storage(format!("metric '{}' was not written", metric.metric_id)))
        })?;
        cache.replace(metric.clone());
        debug!(metric_id = %metric.metric_id, row_id, "metric stored");
        Ok(row_id)
    }

    /// Updates every field except `last_timestamp`, which only moves forward.
    pub fn update_metric(&self, metric: &Metric) -> StoreResult<bool> {
        let mut cache = self.cache.write()?;
        let stored = self.sql.with_transaction(|statements| {
            let mut fields = metric.to_field_map();
            fields.remove("last_timestamp");
            let changed = statements.update(Table::Metric, &fields, &by_metric_id(&metric.metric_id))?;
            if changed == 0 {
                return Ok(None);
            }
            statements.execute_cached(
                ADVANCE_LAST_TIMESTAMP_SQL,
                params![metric.last_timestamp, metric.metric_id],
            )?;
            statements
                .query(Table::Metric, None, &by_metric_id(&metric.metric_id), None)?
                .into_records::<Metric>()
                .map(|records| records.into_iter().next())
        })?;

        match stored {
            Some(stored) => {
                cache.replace(stored);
                debug!(metric_id = %metric.metric_id, "metric updated");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete_metric(&self, metric_id: &str) -> StoreResult<usize> {
        let mut cache = self.cache.write()?;
        let (deleted, orphaned_instance) = self
            .sql
            .with_transaction(|statements| delete_metric_rows(statements, metric_id))?;
        if deleted > 0 {
            cache.remove(metric_id);
            if let Some(instance_id) = orphaned_instance {
                cache.remove_instance_name(&instance_id);
            }
            debug!(metric_id, "metric deleted");
        }
        Ok(deleted)
    }

    pub fn get_metric(&self, metric_id: &str) -> StoreResult<Option<Metric>> {
        self.ensure_cache_loaded()?;
        self.cache.get(metric_id)
    }

    pub fn get_all_metrics(&self) -> StoreResult<Vec<Metric>> {
        self.ensure_cache_loaded()?;
        self.cache.all()
    }

    pub fn get_metrics_by_instance_id(&self, instance_id: &str) -> StoreResult<Vec<Metric>> {
        self.ensure_cache_loaded()?;
        self.cache.by_instance(instance_id)
    }

    // ─── Metric data ──────────────────────────────────────────────────────────

    pub fn add_metric_data_batch(&self, batch: &[MetricData]) -> StoreResult<bool> {
        Ok(self.add_metric_data_batch_detailed(batch)?.any_inserted())
    }

    /// Inserts new points (duplicates are skipped) and moves each metric's
    /// `last_timestamp` forward with a guarded update, so late or reordered
    /// batches never pull it back.
    pub fn add_metric_data_batch_detailed(&self, batch: &[MetricData]) -> StoreResult<BatchOutcome> {
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut cache = self.cache.write()?;
        let mut known = cache.last_timestamps(batch.iter().map(|item| item.metric_id.as_str()));

        let (outcome, advanced) = self.sql.with_transaction(|statements| {
            let mut insert =
                statements.prepare_batch_insert(Table::MetricData, MetricData::COLUMNS, ConflictPolicy::Ignore)?;
            let mut outcome = BatchOutcome::default();
            let mut advanced: HashMap<String, i64> = HashMap::new();

            for (index, item) in batch.iter().enumerate() {
                match item.validate().and_then(|_| insert.execute(&item.to_field_map())) {
                    Ok(true) => outcome.inserted += 1,
                    Ok(false) => {
                        outcome.ignored += 1;
                        continue;
                    }
                    Err(error) => {
                        warn!(metric_id = %item.metric_id, index, error = %error, "metric data row rejected");
                        outcome.failures.push(RowFailure {
                            index,
                            reason: error.to_string(),
                        });
                        continue;
                    }
                }

                let newer = known
                    .get(&item.metric_id)
                    .map_or(true, |last| item.timestamp > *last);
                if !newer {
                    continue;
                }
                match statements.execute_cached(ADVANCE_LAST_TIMESTAMP_SQL, params![item.timestamp, item.metric_id]) {
                    Ok(changed) if changed > 0 => {
                        known.insert(item.metric_id.clone(), item.timestamp);
                        advanced.insert(item.metric_id.clone(), item.timestamp);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(metric_id = %item.metric_id, error = %error, "last timestamp not advanced");
                    }
                }
            }
            Ok((outcome, advanced))
        })?;

        for (metric_id, timestamp) in advanced {
            cache.advance_last_timestamp(&metric_id, timestamp);
        }
        drop(cache);
        debug!(
            inserted = outcome.inserted,
            ignored = outcome.ignored,
            failed = outcome.failures.len(),
            "metric data batch stored"
        );
        Ok(outcome)
    }

    /// Time bounds are inclusive; `anomaly_score` 0 and `limit` 0 disable those filters.
    pub fn get_metric_data(
        &self,
        metric_id: Option<&str>,
        columns: Option<&[&str]>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        anomaly_score: f64,
        limit: u32,
    ) -> StoreResult<Cursor> {
        let projection = MetricData::projection(columns)?;
        let mut selection = with_min_score(time_range(from, to), anomaly_score);
        if let Some(metric_id) = metric_id {
            selection = selection.equals("metric_id", metric_id.to_string());
        }
        self.sql.with_connection(|statements| {
            statements.query_distinct(
                Table::MetricData,
                projection.as_deref(),
                &selection,
                Some("timestamp ASC"),
                limit_of(limit),
            )
        })
    }

    // ─── Instance data ────────────────────────────────────────────────────────

    pub fn add_instance_data_batch(&self, batch: &[InstanceData]) -> StoreResult<bool> {
        Ok(self.add_instance_data_batch_detailed(batch)?.any_inserted())
    }

    pub fn add_instance_data_batch_detailed(&self, batch: &[InstanceData]) -> StoreResult<BatchOutcome> {
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let outcome = self.sql.with_transaction(|statements| {
            let mut insert = statements.prepare_batch_insert(
                Table::InstanceData,
                InstanceData::COLUMNS,
                ConflictPolicy::Replace,
            )?;
            let mut outcome = BatchOutcome::default();
            for (index, item) in batch.iter().enumerate() {
                match item.validate().and_then(|_| insert.execute(&item.to_field_map())) {
                    Ok(true) => outcome.inserted += 1,
                    Ok(false) => outcome.ignored += 1,
                    Err(error) => {
                        warn!(instance_id = %item.instance_id, index, error = %error, "instance data row rejected");
                        outcome.failures.push(RowFailure {
                            index,
                            reason: error.to_string(),
                        });
                    }
                }
            }
            Ok(outcome)
        })?;
        debug!(inserted = outcome.inserted, failed = outcome.failures.len(), "instance data batch stored");
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_instance_data(
        &self,
        instance_id: Option<&str>,
        columns: Option<&[&str]>,
        aggregation: Option<AggregationType>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        anomaly_score: f64,
        limit: u32,
    ) -> StoreResult<Cursor> {
        let projection = InstanceData::projection(columns)?;
        let mut selection = time_range(from, to);
        if let Some(aggregation) = aggregation {
            selection = selection.equals("aggregation", aggregation.minutes());
        }
        selection = with_min_score(selection, anomaly_score);
        if let Some(instance_id) = instance_id {
            selection = selection.equals("instance_id", instance_id.to_string());
        }
        self.sql.with_connection(|statements| {
            statements.query_distinct(
                Table::InstanceData,
                projection.as_deref(),
                &selection,
                Some("timestamp ASC"),
                limit_of(limit),
            )
        })
    }

    pub fn update_instance_data(&self, record: &InstanceData) -> StoreResult<bool> {
        record.validate()?;
        let selection = Selection::new()
            .equals("aggregation", record.aggregation)
            .equals("instance_id", record.instance_id.clone())
            .equals("timestamp", record.timestamp);
        let changed = self
            .sql
            .with_transaction(|statements| statements.update(Table::InstanceData, &record.to_field_map(), &selection))?;
        Ok(changed > 0)
    }

    pub fn delete_instance_data(&self, instance_id: &str) -> StoreResult<usize> {
        self.sql
            .with_transaction(|statements| statements.delete(Table::InstanceData, &by_instance_id(instance_id)))
    }

    // ─── Instances ────────────────────────────────────────────────────────────

    pub fn get_all_instances(&self) -> StoreResult<BTreeSet<String>> {
        if !self.cache.is_loaded()? || self.cache.instance_map_is_empty()? {
            self.rebuild_cache()?;
        }
        self.cache.instances()
    }

    /// Display name for the instance, or the id itself when no usable name is recorded.
    pub fn get_server_name(&self, instance_id: &str) -> StoreResult<String> {
        self.get_all_instances()?;
        match self.cache.server_name(instance_id)? {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Ok(instance_id.to_string()),
        }
    }

    /// Removes the instance's aggregated data, annotations and metrics in one
    /// transaction. The metric list is taken from the cache before anything
    /// is deleted; cache entries are evicted after commit, before the cache
    /// guard is released.
    pub fn delete_instance(&self, instance_id: &str) -> StoreResult<InstanceDeletion> {
        let mut cache = self.write_loaded_cache()?;
        let metric_ids: Vec<String> = cache
            .by_instance(instance_id)
            .into_iter()
            .map(|metric| metric.metric_id)
            .collect();

        let deletion = self.sql.with_transaction(|statements| {
            let by_instance = by_instance_id(instance_id);
            let instance_data_rows = statements.delete(Table::InstanceData, &by_instance)?;
            let annotations = statements.delete(Table::Annotation, &by_instance)?;

            let mut metrics = Vec::with_capacity(metric_ids.len());
            for metric_id in &metric_ids {
                let (deleted, _) = delete_metric_rows(statements, metric_id)?;
                if deleted > 0 {
                    metrics.push(metric_id.clone());
                }
            }
            let stray_points = statements.execute_cached(DELETE_INSTANCE_METRIC_DATA_SQL, params![instance_id])?;
            let stray = statements.delete(Table::Metric, &by_instance)?;
            if stray > 0 {
                warn!(instance_id, stray, stray_points, "deleted metric rows missing from the cache");
            }

            Ok(InstanceDeletion {
                instance_data_rows,
                annotations,
                metrics,
            })
        })?;

        for metric_id in &deletion.metrics {
            cache.remove(metric_id);
        }
        cache.remove_instance_name(instance_id);
        drop(cache);
        info!(
            instance_id,
            metrics = deletion.metrics.len(),
            annotations = deletion.annotations,
            instance_data_rows = deletion.instance_data_rows,
            "instance deleted"
        );
        Ok(deletion)
    }

    // ─── Notifications ────────────────────────────────────────────────────────

    pub fn add_notification(
        &self,
        notification_id: &str,
        metric_id: &str,
        timestamp: i64,
        description: &str,
    ) -> StoreResult<i64> {
        self.add_notification_record(&Notification::unread(notification_id, metric_id, timestamp, description))
    }

    /// Replaces the stored notification when `local_id` is set.
    pub fn add_notification_record(&self, notification: &Notification) -> StoreResult<i64> {
        let local_id = self.sql.with_transaction(|statements| {
            statements
                .insert(Table::Notification, &notification.to_field_map(), ConflictPolicy::Replace)?
                .ok_or_else(|| {
                    StoreError::Storage(format!("notification '{}' was not written", notification.notification_id))
                })
        })?;
        debug!(local_id, metric_id = %notification.metric_id, "notification stored");
        Ok(local_id)
    }

    /// `None` when there are no notifications at all.
    pub fn get_all_notifications(&self) -> StoreResult<Option<Vec<Notification>>> {
        let notifications = self.sql.with_connection(|statements| {
            statements
                .query(Table::Notification, None, &Selection::new(), Some("local_id ASC"))?
                .into_records::<Notification>()
        })?;
        Ok(non_empty(notifications))
    }

    pub fn get_notification_by_local_id(&self, local_id: i64) -> StoreResult<Option<Notification>> {
        let found = self.sql.with_connection(|statements| {
            statements
                .query(Table::Notification, None, &by_local_id(local_id), None)?
                .into_records::<Notification>()
        })?;
        Ok(found.into_iter().next())
    }

    pub fn get_unread_notification_count(&self) -> StoreResult<u64> {
        self.sql.with_connection(|statements| {
            statements.count(Table::Notification, &Selection::new().predicate("read = 0"))
        })
    }

    pub fn get_notification_count(&self) -> StoreResult<u64> {
        self.sql
            .with_connection(|statements| statements.count(Table::Notification, &Selection::new()))
    }

    pub fn mark_notification_read(&self, local_id: i64) -> StoreResult<bool> {
        let mut fields = FieldMap::new();
        fields.insert("read", Value::Integer(1));
        let changed = self
            .sql
            .with_transaction(|statements| statements.update(Table::Notification, &fields, &by_local_id(local_id)))?;
        Ok(changed > 0)
    }

    pub fn delete_notification(&self, local_id: i64) -> StoreResult<usize> {
        self.sql
            .with_transaction(|statements| statements.delete(Table::Notification, &by_local_id(local_id)))
    }

    pub fn delete_all_notifications(&self) -> StoreResult<usize> {
        let deleted = self
            .sql
            .with_transaction(|statements| statements.delete(Table::Notification, &Selection::new()))?;
        info!(deleted, "notifications cleared");
        Ok(deleted)
    }

    // ─── Annotations ──────────────────────────────────────────────────────────

    /// Rejected with `Validation` when the instance is unknown to the metadata cache.
    pub fn add_annotation(&self, annotation: &Annotation) -> StoreResult<i64> {
        let cache = self.write_loaded_cache()?;
        if !cache.has_instance(&annotation.instance_id) {
            warn!(
                annotation_id = %annotation.annotation_id,
                instance_id = %annotation.instance_id,
                "annotation rejected for unknown instance"
            );
            return Err(StoreError::Validation(format!(
                "unknown instance '{}' for annotation '{}'",
                annotation.instance_id, annotation.annotation_id
            )));
        }
        let row_id = self.sql.with_transaction(|statements| {
            statements
                .insert(Table::Annotation, &annotation.to_field_map(), ConflictPolicy::Replace)?
                .ok_or_else(|| {
                    StoreError::Storage(format!("annotation '{}' was not written", annotation.annotation_id))
                })
        })?;
        drop(cache);
        debug!(annotation_id = %annotation.annotation_id, row_id, "annotation stored");
        Ok(row_id)
    }

    /// `None` when there are no annotations at all.
    pub fn get_all_annotations(&self) -> StoreResult<Option<Vec<Annotation>>> {
        let annotations = self.sql.with_connection(|statements| {
            statements
                .query(Table::Annotation, None, &Selection::new(), Some("timestamp ASC, created ASC"))?
                .into_records::<Annotation>()
        })?;
        Ok(non_empty(annotations))
    }

    pub fn get_annotation(&self, annotation_id: &str) -> StoreResult<Option<Annotation>> {
        let found = self.sql.with_connection(|statements| {
            statements
                .query(Table::Annotation, None, &by_annotation_id(annotation_id), None)?
                .into_records::<Annotation>()
        })?;
        Ok(found.into_iter().next())
    }

    pub fn get_annotations(
        &self,
        server: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Annotation>> {
        let mut selection = time_range(from, to);
        if let Some(server) = server {
            selection = selection.equals("instance_id", server.to_string());
        }
        self.sql.with_connection(|statements| {
            statements
                .query(Table::Annotation, None, &selection, Some("timestamp ASC, created ASC"))?
                .into_records::<Annotation>()
        })
    }

    pub fn delete_annotation(&self, annotation_id: &str) -> StoreResult<usize> {
        self.sql
            .with_transaction(|statements| statements.delete(Table::Annotation, &by_annotation_id(annotation_id)))
    }

    pub fn delete_annotation_by_instance_id(&self, instance_id: &str) -> StoreResult<usize> {
        self.sql
            .with_transaction(|statements| statements.delete(Table::Annotation, &by_instance_id(instance_id)))
    }

    // ─── Maintenance ──────────────────────────────────────────────────────────

    pub fn delete_all(&self) -> StoreResult<()> {
        let mut cache = self.cache.write()?;
        self.sql.with_transaction(|statements| {
            for table in Table::ALL {
                statements.delete(table, &Selection::new())?;
            }
            Ok(())
        })?;
        cache.clear();
        drop(cache);
        info!("all tables cleared");
        Ok(())
    }

    /// Retention pruning is not implemented; always `NotSupported` so callers
    /// cannot read it as "nothing was old enough". Hosts that expect the
    /// integer result map the error with [`StoreError::retention_sentinel`].
    pub fn delete_old_records(&self) -> StoreResult<usize> {
        Err(StoreError::NotSupported("retention pruning is not implemented".to_string()))
    }
}

/// Deletes the metric, its data points, and, once the instance has no
/// metric left, the instance's annotations. Returns the metric row count and
/// the orphaned instance id.
fn delete_metric_rows(statements: &Statements<'_>, metric_id: &str) -> StoreResult<(usize, Option<String>)> {
    let instance_id = statements
        .query(Table::Metric, Some(&["instance_id"][..]), &by_metric_id(metric_id), None)?
        .next()
        .map(|row| row.get::<String>("instance_id"))
        .transpose()?;

    let deleted = statements.delete(Table::Metric, &by_metric_id(metric_id))?;
    if deleted == 0 {
        return Ok((0, None));
    }
    statements.delete(Table::MetricData, &by_metric_id(metric_id))?;

    let Some(instance_id) = instance_id else {
        return Ok((deleted, None));
    };
    if statements.count(Table::Metric, &by_instance_id(&instance_id))? > 0 {
        return Ok((deleted, None));
    }
    statements.delete(Table::Annotation, &by_instance_id(&instance_id))?;
    Ok((deleted, Some(instance_id)))
}

fn by_metric_id(metric_id: &str) -> Selection {
    Selection::new().equals("metric_id", metric_id.to_string())
}

fn by_instance_id(instance_id: &str) -> Selection {
    Selection::new().equals("instance_id", instance_id.to_string())
}

fn by_annotation_id(annotation_id: &str) -> Selection {
    Selection::new().equals("annotation_id", annotation_id.to_string())
}

fn by_local_id(local_id: i64) -> Selection {
    Selection::new().equals("local_id", local_id)
}

fn time_range(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Selection {
    let mut selection = Selection::new();
    if let Some(from) = from {
        selection = selection.at_least("timestamp", to_epoch_millis(from));
    }
    if let Some(to) = to {
        selection = selection.at_most("timestamp", to_epoch_millis(to));
    }
    selection
}

fn with_min_score(selection: Selection, anomaly_score: f64) -> Selection {
    if anomaly_score > 0.0 {
        selection.at_least("anomaly_score", anomaly_score)
    } else {
        selection
    }
}

fn limit_of(limit: u32) -> Option<u32> {
    (limit > 0).then_some(limit)
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConflictPolicy, Database, Record, Table};
    use crate::errors::StoreError;
    use crate::models::{Annotation, InstanceData, Metric, MetricData, RETENTION_NOT_SUPPORTED};
    use chrono::{DateTime, Utc};

    fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::new(&dir.path().join("test.db")).expect("db")
    }

    fn point(metric_id: &str, timestamp: i64, value: f64, anomaly_score: f64) -> MetricData {
        MetricData {
            metric_id: metric_id.to_string(),
            timestamp,
            metric_value: value,
            anomaly_score,
        }
    }

    fn metric_at(metric_id: &str, instance_id: &str, last_timestamp: i64) -> Metric {
        let mut metric = Metric::new(metric_id, instance_id, "server-one");
        metric.last_timestamp = last_timestamp;
        metric
    }

    #[test]
    fn added_metric_round_trips_through_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let mut metric = metric_at("m1", "i1", 50);
        metric.parameters = serde_json::json!({ "unit": "percent", "window": 5 });

        db.add_metric(&metric).expect("add metric");
        assert_eq!(db.get_metric("m1").expect("get metric"), Some(metric.clone()));

        let reopened = open_db(&dir);
        assert_eq!(reopened.get_metric("m1").expect("get metric"), Some(metric));
    }

    #[test]
    fn batch_advances_last_timestamp_and_query_finds_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&metric_at("m1", "i1", 50)).expect("add metric");

        assert!(db
            .add_metric_data_batch(&[point("m1", 100, 5.0, 0.1)])
            .expect("add batch"));
        assert_eq!(db.get_metric("m1").expect("get").map(|m| m.last_timestamp), Some(100));

        let rows: Vec<MetricData> = db
            .get_metric_data(
                Some("m1"),
                None,
                DateTime::<Utc>::from_timestamp_millis(90),
                DateTime::<Utc>::from_timestamp_millis(110),
                0.0,
                0,
            )
            .expect("query")
            .into_records()
            .expect("records");
        assert_eq!(rows, vec![point("m1", 100, 5.0, 0.1)]);
    }

    #[test]
    fn out_of_order_batches_never_regress_last_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&metric_at("m1", "i1", 0)).expect("add metric");

        db.add_metric_data_batch(&[point("m1", 200, 1.0, 0.0)]).expect("late batch");
        db.add_metric_data_batch(&[point("m1", 100, 1.0, 0.0)]).expect("early batch");
        assert_eq!(db.get_metric("m1").expect("get").map(|m| m.last_timestamp), Some(200));

        db.rebuild_cache().expect("rebuild");
        assert_eq!(db.get_metric("m1").expect("get").map(|m| m.last_timestamp), Some(200));
    }

    #[test]
    fn duplicate_points_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&metric_at("m1", "i1", 0)).expect("add metric");

        let outcome = db
            .add_metric_data_batch_detailed(&[point("m1", 10, 1.0, 0.0), point("m1", 10, 9.0, 0.0)])
            .expect("batch");
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.ignored, 1);
        assert!(outcome.failures.is_empty());

        let rows: Vec<MetricData> = db
            .get_metric_data(Some("m1"), None, None, None, 0.0, 0)
            .expect("query")
            .into_records()
            .expect("records");
        assert_eq!(rows, vec![point("m1", 10, 1.0, 0.0)]);

        assert!(!db.add_metric_data_batch(&[point("m1", 10, 3.0, 0.0)]).expect("repeat"));
        assert!(!db.add_metric_data_batch(&[]).expect("empty"));
    }

    #[test]
    fn update_metric_keeps_newer_last_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&metric_at("m1", "i1", 300)).expect("add metric");

        let mut stale = metric_at("m1", "i1", 100);
        stale.server_name = "renamed".to_string();
        assert!(db.update_metric(&stale).expect("update"));

        let cached = db.get_metric("m1").expect("get").expect("metric");
        assert_eq!(cached.last_timestamp, 300);
        assert_eq!(cached.server_name, "renamed");
        assert_eq!(db.get_server_name("i1").expect("name"), "renamed");

        assert!(!db.update_metric(&metric_at("missing", "i1", 0)).expect("update missing"));
        assert!(db.get_metric("missing").expect("get").is_none());
    }

    #[test]
    fn deleting_last_metric_of_instance_drops_name_and_annotations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&metric_at("m1", "i1", 0)).expect("add metric");
        db.add_metric(&metric_at("m2", "i1", 0)).expect("add metric");
        db.add_annotation(&Annotation::new("i1", 10, "phone", "ops", "deploy"))
            .expect("annotation");

        assert_eq!(db.delete_metric("m1").expect("delete"), 1);
        assert!(db.get_all_instances().expect("instances").contains("i1"));
        assert!(db.get_all_annotations().expect("annotations").is_some());

        assert_eq!(db.delete_metric("m2").expect("delete"), 1);
        assert!(db.get_all_instances().expect("instances").is_empty());
        assert!(db.get_all_annotations().expect("annotations").is_none());
        assert_eq!(db.delete_metric("m2").expect("delete again"), 0);
    }

    #[test]
    fn delete_instance_clears_every_table_for_the_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&metric_at("m1", "i1", 0)).expect("add metric");
        db.add_metric(&metric_at("m2", "i1", 0)).expect("add metric");
        db.add_metric(&metric_at("m3", "i2", 0)).expect("add metric");
        db.add_instance_data_batch(&[InstanceData {
            instance_id: "i1".to_string(),
            aggregation: 5,
            timestamp: 10,
            anomaly_score: 0.5,
            metric_mask: 3,
        }])
        .expect("instance data");
        db.add_annotation(&Annotation::new("i1", 10, "phone", "ops", "note"))
            .expect("annotation");

        let deletion = db.delete_instance("i1").expect("delete instance");
        assert_eq!(deletion.metrics, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(deletion.annotations, 1);
        assert_eq!(deletion.instance_data_rows, 1);

        assert!(db.get_metrics_by_instance_id("i1").expect("metrics").is_empty());
        assert!(!db.get_all_instances().expect("instances").contains("i1"));
        assert!(db.get_all_annotations().expect("annotations").is_none());
        let remaining = db
            .get_instance_data(Some("i1"), None, None, None, None, 0.0, 0)
            .expect("instance data");
        assert!(remaining.is_empty());
        assert!(db.get_metric("m3").expect("get").is_some());
    }

    #[test]
    fn annotation_for_unknown_instance_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let result = db.add_annotation(&Annotation::new("ghost", 10, "phone", "ops", "hello"));
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert!(db.get_all_annotations().expect("annotations").is_none());
    }

    #[test]
    fn notifications_distinguish_absent_from_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        assert!(db.get_all_notifications().expect("notifications").is_none());

        let local_id = db
            .add_notification("n1", "m1", 10, "anomaly spike")
            .expect("add notification");
        let all = db.get_all_notifications().expect("notifications").expect("present");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].local_id, Some(local_id));
        assert_eq!(db.get_unread_notification_count().expect("unread"), 1);

        assert!(db.mark_notification_read(local_id).expect("mark read"));
        assert_eq!(db.get_unread_notification_count().expect("unread"), 0);
        assert_eq!(db.get_notification_count().expect("count"), 1);
        assert!(db
            .get_notification_by_local_id(local_id)
            .expect("by id")
            .map(|notification| notification.read)
            .unwrap_or(false));

        assert_eq!(db.delete_notification(local_id).expect("delete"), 1);
        assert!(db.get_notification_by_local_id(local_id).expect("by id").is_none());
    }

    #[test]
    fn delete_all_empties_tables_and_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&metric_at("m1", "i1", 0)).expect("add metric");
        db.add_metric_data_batch(&[point("m1", 1, 1.0, 0.0)]).expect("batch");
        db.add_notification("n1", "m1", 1, "x").expect("notification");

        db.delete_all().expect("delete all");
        assert!(db.get_all_metrics().expect("metrics").is_empty());
        assert!(db.get_all_instances().expect("instances").is_empty());
        assert!(db.get_all_notifications().expect("notifications").is_none());
        assert!(db
            .get_metric_data(None, None, None, None, 0.0, 0)
            .expect("data")
            .is_empty());
    }

    #[test]
    fn retention_reports_not_supported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        let result = db.delete_old_records();
        assert!(matches!(result, Err(StoreError::NotSupported(_))));
        assert_eq!(
            result.err().and_then(|error| error.retention_sentinel()),
            Some(RETENTION_NOT_SUPPORTED)
        );
        assert_eq!(StoreError::Busy("x".to_string()).retention_sentinel(), None);
    }

    #[test]
    fn non_finite_rows_are_reported_and_siblings_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&metric_at("m1", "i1", 0)).expect("add metric");

        let outcome = db
            .add_metric_data_batch_detailed(&[
                point("m1", 10, 1.0, 0.0),
                point("m1", 20, f64::NAN, 0.0),
                point("m1", 30, 3.0, 0.0),
            ])
            .expect("batch");
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.ignored, 0);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 1);
        assert!(outcome.failures[0].reason.contains("metric_value"));
        assert_eq!(db.get_metric("m1").expect("get").map(|m| m.last_timestamp), Some(30));

        let timestamps: Vec<i64> = db
            .get_metric_data(Some("m1"), None, None, None, 0.0, 0)
            .expect("query")
            .into_records::<MetricData>()
            .expect("records")
            .into_iter()
            .map(|row| row.timestamp)
            .collect();
        assert_eq!(timestamps, vec![10, 30]);

        let bucket = InstanceData {
            instance_id: "i1".to_string(),
            aggregation: 5,
            timestamp: 10,
            anomaly_score: 0.4,
            metric_mask: 1,
        };
        db.add_instance_data_batch(&[bucket.clone()]).expect("instance data");
        let poisoned = InstanceData {
            anomaly_score: f64::NAN,
            ..bucket.clone()
        };
        let outcome = db
            .add_instance_data_batch_detailed(&[poisoned.clone()])
            .expect("instance batch");
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(db.update_instance_data(&poisoned), Err(StoreError::Validation(_))));

        let stored: Vec<InstanceData> = db
            .get_instance_data(Some("i1"), None, None, None, None, 0.0, 0)
            .expect("query")
            .into_records()
            .expect("records");
        assert_eq!(stored, vec![bucket]);
    }

    #[test]
    fn delete_instance_removes_points_of_uncached_metrics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&metric_at("m1", "i1", 0)).expect("add metric");
        db.sql
            .with_transaction(|statements| {
                let stray = Metric::new("stray", "i1", "server-one");
                statements.insert(Table::Metric, &stray.to_field_map(), ConflictPolicy::Replace)?;
                statements.insert(
                    Table::MetricData,
                    &point("stray", 5, 1.0, 0.0).to_field_map(),
                    ConflictPolicy::Replace,
                )
            })
            .expect("write behind the cache");
        assert!(db.get_metric("stray").expect("get").is_none());

        let deletion = db.delete_instance("i1").expect("delete instance");
        assert_eq!(deletion.metrics, vec!["m1".to_string()]);
        assert!(db
            .get_metric_data(Some("stray"), None, None, None, 0.0, 0)
            .expect("query")
            .is_empty());
        db.rebuild_cache().expect("rebuild");
        assert!(db.get_all_metrics().expect("metrics").is_empty());
    }

    #[test]
    fn server_name_falls_back_to_instance_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&Metric::new("m1", "i-blank", "  ")).expect("add metric");
        db.add_metric(&Metric::new("m2", "i-named", "web-01")).expect("add metric");

        assert_eq!(db.get_server_name("i-blank").expect("name"), "i-blank");
        assert_eq!(db.get_server_name("i-named").expect("name"), "web-01");
        assert_eq!(db.get_server_name("i-unknown").expect("name"), "i-unknown");
    }

    #[test]
    fn replacing_metric_with_new_instance_moves_name_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(&dir);
        db.add_metric(&Metric::new("m1", "i1", "old")).expect("add metric");
        db.add_metric(&Metric::new("m1", "i2", "new")).expect("replace metric");

        let instances = db.get_all_instances().expect("instances");
        assert_eq!(instances.into_iter().collect::<Vec<_>>(), vec!["i2".to_string()]);
    }
}
