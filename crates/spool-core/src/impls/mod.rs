//! Port implementations.
//!
//! - **InMemoryBroker**: queues in process memory, for development, eager
//!   setups and tests. A networked broker plugs in behind the same `Broker`
//!   trait.

pub mod inmem_broker;

pub use self::inmem_broker::InMemoryBroker;
