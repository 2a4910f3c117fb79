//! Ports: the seams where broker, context, clock and id generation are swapped.

pub mod broker;
pub mod clock;
pub mod context_provider;
pub mod id_generator;

pub use self::broker::{Broker, Delivery, QueueStats};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::context_provider::{BasicContextProvider, ContextProvider};
pub use self::id_generator::{IdGenerator, UlidGenerator};
