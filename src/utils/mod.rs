pub mod bounded_set;
pub mod config;
pub mod event_queue;
pub mod logging;

pub use bounded_set::BoundedOrderedSet;
pub use event_queue::EventQueue;
