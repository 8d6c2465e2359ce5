//! Small helpers shared between the netacct daemon and its tooling.

mod ifindex;
pub mod unix_time;

pub use ifindex::interface_index;
