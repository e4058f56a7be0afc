use std::time::Duration;
use streamq_core::{Configuration, TaskFailure};

/// What the loop does with a message after its handler failed.
#[derive(Debug, PartialEq, Eq)]
pub enum FailureAction {
    /// Re-enqueue a fresh copy after `delay`, then ack the original.
    Retry { delay: Duration },

    /// Move to the dead-letter destination with this reason.
    DeadLetter { reason: String },
}

/// Apply the handler's retry classification and the attempt budget.
///
/// `attempt` is the header value of the current delivery: the message has now
/// been delivered `attempt + 1` times.
pub fn classify_failure(
    failure: &TaskFailure,
    attempt: u32,
    config: &Configuration,
) -> FailureAction {
    match failure {
        TaskFailure::Permanent(reason) => FailureAction::DeadLetter {
            reason: format!("permanent failure: {reason}"),
        },
        TaskFailure::Transient(reason) => {
            if attempt + 1 >= config.max_attempts {
                FailureAction::DeadLetter {
                    reason: format!(
                        "retries exhausted after {} attempts: {reason}",
                        attempt + 1
                    ),
                }
            } else {
                FailureAction::Retry {
                    delay: config.retry_backoff(attempt),
                }
            }
        }
    }
}
