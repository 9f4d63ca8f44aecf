//! Ports: the seams between the scheduling engine and the outside world.
//!
//! - `TaskStore`: task records and dependency edges (source of truth)
//! - `Transport`: the message broker connection
//! - `TaskExecutor`: the task body
//! - `Clock` / `IdGenerator`: time and identity, swappable in tests

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod task_store;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::TaskExecutor;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
pub use self::transport::{Delivery, OutboundMessage, QueueDeclaration, Subscription, Transport};
