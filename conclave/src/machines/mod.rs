//! The resource state machines shipped with this crate.

pub mod multimap;
pub mod queue;
pub mod topic;
pub mod value;

pub use multimap::MultiMapMachine;
pub use queue::TaskQueueMachine;
pub use topic::TopicMachine;
pub use value::ValueMachine;
