//! Producer-side API: binds a task invocation, a serialization backend and a
//! broker into a single enqueue operation.

mod publisher;

pub use publisher::Publisher;
