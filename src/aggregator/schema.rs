use std::collections::HashMap;

use tracing::trace;

use crate::task::{CategoryId, TaskPack};

use super::aggregate::MetricAggregate;
use super::Aggregator;

// The YAML-facing definitions live in crate::config; re-exported here so the
// aggregator can be built without reaching into the config module.
pub use crate::config::{MetricDef, MetricKind};

/// Aggregator driven by a declarative list of metric definitions.
///
/// Each definition contributes exactly one integer to the snapshot, in
/// declaration order. Several definitions may share a category id, in which
/// case one task folds into all of them (e.g. a count and a sum of the same
/// stream).
pub struct SchemaAggregator {
    defs: Vec<MetricDef>,
    values: Vec<MetricAggregate>,
    /// Category id -> indices into `values`.
    by_category: HashMap<CategoryId, Vec<usize>>,
}

impl SchemaAggregator {
    /// Builds an aggregator from metric definitions.
    pub fn new(defs: Vec<MetricDef>) -> Self {
        let mut by_category: HashMap<CategoryId, Vec<usize>> = HashMap::new();
        for (idx, def) in defs.iter().enumerate() {
            by_category.entry(def.id).or_default().push(idx);
        }

        let values = defs.iter().map(|d| MetricAggregate::new(d.kind)).collect();

        Self {
            defs,
            values,
            by_category,
        }
    }

    /// Metric names in snapshot order.
    pub fn schema(&self) -> Vec<&str> {
        self.defs.iter().map(|d| d.name.as_str()).collect()
    }

    /// Number of integers emitted per snapshot.
    pub fn width(&self) -> usize {
        self.defs.len()
    }

    /// Current value of the named metric.
    pub fn value(&self, name: &str) -> Option<i32> {
        self.defs
            .iter()
            .position(|d| d.name == name)
            .and_then(|idx| self.values.get(idx))
            .map(MetricAggregate::value)
    }
}

impl Aggregator for SchemaAggregator {
    fn collect(&mut self, category: CategoryId, task: TaskPack) -> bool {
        let Some(indices) = self.by_category.get(&category) else {
            trace!(category, "no metric registered for category");
            return false;
        };

        for &idx in indices {
            let slot = self.defs[idx].slot;
            let value = task.try_get(slot).unwrap_or(0);
            self.values[idx].record(value);
        }

        true
    }

    fn marshal(&mut self, out: &mut Vec<i32>) -> bool {
        out.extend(self.values.iter().map(MetricAggregate::value));
        true
    }

    fn reset(&mut self) {
        for value in &mut self.values {
            value.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEND_PACKET: CategoryId = 1;
    const SEND_PACKET_AMOUNT: CategoryId = 2;

    fn packet_schema() -> SchemaAggregator {
        SchemaAggregator::new(vec![
            MetricDef::new(SEND_PACKET, "send_packet", MetricKind::Count),
            MetricDef::new(SEND_PACKET_AMOUNT, "send_packet_amount", MetricKind::Sum),
        ])
    }

    #[test]
    fn test_collect_known_categories() {
        let mut agg = packet_schema();
        assert!(agg.collect(SEND_PACKET, TaskPack::new()));
        assert!(agg.collect(SEND_PACKET, TaskPack::new()));
        assert!(agg.collect(SEND_PACKET_AMOUNT, TaskPack::from_values([1000])));

        assert_eq!(agg.value("send_packet"), Some(2));
        assert_eq!(agg.value("send_packet_amount"), Some(1000));
    }

    #[test]
    fn test_unknown_category_is_not_handled() {
        let mut agg = packet_schema();
        assert!(!agg.collect(99, TaskPack::from_values([5])));
        assert_eq!(agg.value("send_packet"), Some(0));
        assert_eq!(agg.value("send_packet_amount"), Some(0));
    }

    #[test]
    fn test_marshal_in_declaration_order_and_appends() {
        let mut agg = packet_schema();
        agg.collect(SEND_PACKET_AMOUNT, TaskPack::from_values([7]));

        let mut out = vec![-1];
        assert!(agg.marshal(&mut out));
        assert_eq!(out, vec![-1, 0, 7]);
    }

    #[test]
    fn test_reset_zeroes_every_metric() {
        let mut agg = packet_schema();
        agg.collect(SEND_PACKET, TaskPack::new());
        agg.collect(SEND_PACKET_AMOUNT, TaskPack::from_values([3]));
        agg.reset();

        let mut out = Vec::new();
        agg.marshal(&mut out);
        assert_eq!(out, vec![0, 0]);
    }

    #[test]
    fn test_shared_category_folds_into_all_definitions() {
        let mut agg = SchemaAggregator::new(vec![
            MetricDef::new(5, "latency_count", MetricKind::Count),
            MetricDef::new(5, "latency_max", MetricKind::Max).with_slot(1),
            MetricDef::new(5, "latency_min", MetricKind::Min).with_slot(1),
        ]);

        agg.collect(5, TaskPack::from_values([0, 40]));
        agg.collect(5, TaskPack::from_values([0, 15]));

        let mut out = Vec::new();
        agg.marshal(&mut out);
        assert_eq!(out, vec![2, 40, 15]);
        assert_eq!(
            agg.schema(),
            vec!["latency_count", "latency_max", "latency_min"]
        );
        assert_eq!(agg.width(), 3);
    }

    #[test]
    fn test_slot_past_capacity_reads_zero() {
        let mut agg =
            SchemaAggregator::new(vec![MetricDef::new(1, "x", MetricKind::Sum).with_slot(42)]);
        assert!(agg.collect(1, TaskPack::from_values([9])));
        assert_eq!(agg.value("x"), Some(0));
    }
}
