pub mod aggregate;
pub mod schema;

use crate::task::{CategoryId, TaskPack};

pub use self::schema::SchemaAggregator;

/// User-supplied folding logic driven by the collector.
///
/// The collector owns the aggregator exclusively and calls it from a single
/// execution context, so implementations need no internal locking. `marshal`
/// and `reset` are always invoked back to back with no `collect` in between.
pub trait Aggregator: Send {
    /// Folds one task into the running state.
    ///
    /// Returns `false` when `category` is not handled by this aggregator.
    /// That is a signal, not an error: the collector simply moves on.
    fn collect(&mut self, category: CategoryId, task: TaskPack) -> bool;

    /// Appends the current state to `out` as a flat, ordered sequence.
    ///
    /// The order is the snapshot schema; readers know it out-of-band.
    fn marshal(&mut self, out: &mut Vec<i32>) -> bool;

    /// Returns the state to zero so the next interval starts clean.
    fn reset(&mut self);
}

impl<A: Aggregator + ?Sized> Aggregator for Box<A> {
    fn collect(&mut self, category: CategoryId, task: TaskPack) -> bool {
        (**self).collect(category, task)
    }

    fn marshal(&mut self, out: &mut Vec<i32>) -> bool {
        (**self).marshal(out)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
