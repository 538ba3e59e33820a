use thiserror::Error;

/// Default number of value slots carried by a task.
pub const DEFAULT_TASK_CAPACITY: usize = 10;

/// Identifies which logical metric a task belongs to.
pub type CategoryId = i32;

/// The task shape moved through the collector pipeline.
pub type TaskPack = Task<i32, DEFAULT_TASK_CAPACITY>;

/// Errors raised by the runtime-checked task constructors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    #[error("task holds at most {capacity} values, got {len}")]
    CapacityExceeded { len: usize, capacity: usize },
}

/// Fixed-capacity measurement record.
///
/// Holds exactly `N` slots of `T`, zero-initialized. Values given at
/// construction fill the leading slots; the rest stay at `T::default()`.
/// The record is immutable once built and lives entirely inline, so moving
/// it across the queue never touches the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task<T, const N: usize> {
    data: [T; N],
}

impl<T: Copy + Default, const N: usize> Task<T, N> {
    /// Creates a task with every slot zeroed.
    pub fn new() -> Self {
        Self {
            data: [T::default(); N],
        }
    }

    /// Creates a task from a fixed-size array of values.
    ///
    /// Supplying more than `N` values fails to compile.
    pub fn from_values<const M: usize>(values: [T; M]) -> Self {
        const {
            assert!(M <= N, "task value count exceeds capacity");
        }

        let mut task = Self::new();
        task.data[..M].copy_from_slice(&values);
        task
    }

    /// Creates a task from a slice whose length is only known at runtime.
    pub fn try_from_slice(values: &[T]) -> Result<Self, TaskError> {
        if values.len() > N {
            return Err(TaskError::CapacityExceeded {
                len: values.len(),
                capacity: N,
            });
        }

        let mut task = Self::new();
        task.data[..values.len()].copy_from_slice(values);
        Ok(task)
    }

    /// Returns the value in slot `I`. Out-of-range indices fail to compile.
    pub fn get<const I: usize>(&self) -> T {
        const {
            assert!(I < N, "task slot index out of range");
        }

        self.data[I]
    }

    /// Returns the value in slot `index`, or `None` past the capacity.
    pub fn try_get(&self, index: usize) -> Option<T> {
        self.data.get(index).copied()
    }

    /// All slots, including the zeroed tail.
    pub fn values(&self) -> &[T; N] {
        &self.data
    }

    /// Number of slots.
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T: Copy + Default, const N: usize> Default for Task<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default, const N: usize> TryFrom<&[T]> for Task<T, N> {
    type Error = TaskError;

    fn try_from(values: &[T]) -> Result<Self, Self::Error> {
        Self::try_from_slice(values)
    }
}
