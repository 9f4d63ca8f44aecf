//! Domain model (IDs, task records, envelope, decisions, errors).

pub mod decision;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider, Gate};
pub use envelope::TaskEnvelope;
pub use errors::{
    CyclicDependencyError, QueueError, StoreError, TaskExecutionError, TransportError,
    WorkerError,
};
pub use ids::{MessageId, TaskId};
pub use task::{NewTask, Priority, RecurrenceType, Task, TaskStatus};
