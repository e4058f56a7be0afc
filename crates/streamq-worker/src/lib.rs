//! Consumer side of streamq: the loop that pulls batches from the broker,
//! dispatches them through the router, and acks, retries or dead-letters
//! each message by outcome.

mod outcome;
mod worker;

pub use outcome::FailureAction;
pub use worker::Worker;
