use crate::errors::{StoreError, StoreResult};
use crate::models::Metric;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Cached metrics keyed by id, plus the display name of every instance they
/// belong to. Writers obtain it through [`MetadataCache::write`].
#[derive(Debug, Default)]
pub struct CacheState {
    by_metric_id: HashMap<String, Metric>,
    instance_to_name: HashMap<String, String>,
    loaded: bool,
}

impl CacheState {
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn clear(&mut self) {
        self.by_metric_id.clear();
        self.instance_to_name.clear();
        self.loaded = false;
    }

    /// Replaces the contents with whatever `load` returns. On error the
    /// state is left empty and unloaded.
    pub fn reload(&mut self, load: impl FnOnce() -> StoreResult<Vec<Metric>>) -> StoreResult<usize> {
        self.clear();
        let metrics = load()?;
        let count = metrics.len();
        for metric in metrics {
            self.upsert(metric);
        }
        self.loaded = true;
        Ok(count)
    }

    pub fn upsert(&mut self, metric: Metric) {
        self.instance_to_name
            .insert(metric.instance_id.clone(), metric.server_name.clone());
        self.by_metric_id.insert(metric.metric_id.clone(), metric);
    }

    /// Upserts and drops the name of the instance the metric moved away from
    /// when nothing else backs it.
    pub fn replace(&mut self, metric: Metric) {
        let previous_instance = self
            .by_metric_id
            .get(&metric.metric_id)
            .map(|previous| previous.instance_id.clone())
            .filter(|previous| *previous != metric.instance_id);
        self.upsert(metric);
        if let Some(previous_instance) = previous_instance {
            self.forget_instance_if_orphaned(&previous_instance);
        }
    }

    /// Raises the cached `last_timestamp`; an older value is ignored.
    pub fn advance_last_timestamp(&mut self, metric_id: &str, timestamp: i64) -> bool {
        match self.by_metric_id.get_mut(metric_id) {
            Some(metric) if metric.last_timestamp < timestamp => {
                metric.last_timestamp = timestamp;
                true
            }
            _ => false,
        }
    }

    /// Evicts the metric only. The caller decides what happens to the
    /// instance name and rows tied to the instance.
    pub fn remove(&mut self, metric_id: &str) -> Option<Metric> {
        self.by_metric_id.remove(metric_id)
    }

    pub fn remove_instance_name(&mut self, instance_id: &str) -> Option<String> {
        self.instance_to_name.remove(instance_id)
    }

    /// Drops the name mapping when no cached metric belongs to the instance.
    pub fn forget_instance_if_orphaned(&mut self, instance_id: &str) -> bool {
        let backed = self
            .by_metric_id
            .values()
            .any(|metric| metric.instance_id == instance_id);
        !backed && self.instance_to_name.remove(instance_id).is_some()
    }

    pub fn get(&self, metric_id: &str) -> Option<&Metric> {
        self.by_metric_id.get(metric_id)
    }

    pub fn by_instance(&self, instance_id: &str) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self
            .by_metric_id
            .values()
            .filter(|metric| metric.instance_id == instance_id)
            .cloned()
            .collect();
        metrics.sort_by(|left, right| left.metric_id.cmp(&right.metric_id));
        metrics
    }

    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.instance_to_name.contains_key(instance_id)
    }

    /// Cached `last_timestamp` per requested metric, absent ids skipped.
    pub fn last_timestamps<'a>(&self, metric_ids: impl IntoIterator<Item = &'a str>) -> HashMap<String, i64> {
        metric_ids
            .into_iter()
            .filter_map(|id| {
                self.by_metric_id
                    .get(id)
                    .map(|metric| (id.to_string(), metric.last_timestamp))
            })
            .collect()
    }
}

/// In-memory projection of the metric table plus the instance display names
/// derived from it. Only clones leave the cache.
///
/// Lock order: this lock may be held while the connection is acquired, never
/// the other way round. Writers hold it from before their transaction opens
/// until the cache reflects the commit, so cache updates land in commit order.
#[derive(Debug, Default)]
pub struct MetadataCache {
    state: Mutex<CacheState>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Internal("metadata cache mutex poisoned".to_string()))
    }

    /// Exclusive access for a writer. Keep the guard across the transaction
    /// and the matching cache update.
    pub fn write(&self) -> StoreResult<MutexGuard<'_, CacheState>> {
        self.lock()
    }

    pub fn invalidate(&self) -> StoreResult<()> {
        self.lock()?.clear();
        Ok(())
    }

    /// The cache stays locked for the duration of the scan so no concurrent
    /// writer can land between the scan and the swap.
    pub fn rebuild_with(&self, load: impl FnOnce() -> StoreResult<Vec<Metric>>) -> StoreResult<usize> {
        self.lock()?.reload(load)
    }

    pub fn is_loaded(&self) -> StoreResult<bool> {
        Ok(self.lock()?.loaded)
    }

    pub fn instance_map_is_empty(&self) -> StoreResult<bool> {
        Ok(self.lock()?.instance_to_name.is_empty())
    }

    pub fn get(&self, metric_id: &str) -> StoreResult<Option<Metric>> {
        Ok(self.lock()?.get(metric_id).cloned())
    }

    pub fn all(&self) -> StoreResult<Vec<Metric>> {
        let mut metrics: Vec<Metric> = self.lock()?.by_metric_id.values().cloned().collect();
        metrics.sort_by(|left, right| left.metric_id.cmp(&right.metric_id));
        Ok(metrics)
    }

    pub fn by_instance(&self, instance_id: &str) -> StoreResult<Vec<Metric>> {
        Ok(self.lock()?.by_instance(instance_id))
    }

    pub fn instances(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self.lock()?.instance_to_name.keys().cloned().collect())
    }

    pub fn server_name(&self, instance_id: &str) -> StoreResult<Option<String>> {
        Ok(self.lock()?.instance_to_name.get(instance_id).cloned())
    }

    pub fn max_last_timestamp(&self) -> StoreResult<Option<i64>> {
        Ok(self
            .lock()?
            .by_metric_id
            .values()
            .map(|metric| metric.last_timestamp)
            .max())
    }
}
