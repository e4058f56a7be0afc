use crate::{QueueError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Retry classification a handler attaches to its failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// Worth retrying, e.g. a downstream timeout.
    Transient(String),

    /// Retrying cannot help; dead-letter immediately.
    Permanent(String),
}

impl TaskFailure {
    pub fn reason(&self) -> &str {
        match self {
            TaskFailure::Transient(reason) | TaskFailure::Permanent(reason) => reason,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskFailure::Transient(reason) => write!(f, "transient failure: {reason}"),
            TaskFailure::Permanent(reason) => write!(f, "permanent failure: {reason}"),
        }
    }
}

pub type HandlerResult = std::result::Result<Value, TaskFailure>;

/// Erased handler capability stored in the router.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, args: Value) -> HandlerResult;
}

/// A registered task: unique name plus its handler.
pub struct TaskDefinition {
    name: String,
    handler: Arc<dyn TaskHandler>,
}

impl TaskDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One call to a named task, built producer-side and consumed exactly once
/// by the publisher.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub task_name: String,
    pub args: Value,
    pub backend_override: Option<String>,
    pub queue_override: Option<String>,
}

impl TaskInvocation {
    /// Encode with a specific registered backend instead of the default.
    pub fn with_backend(mut self, tag: impl Into<String>) -> Self {
        self.backend_override = Some(tag.into());
        self
    }

    /// Enqueue onto a specific queue instead of the configured default.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_override = Some(queue.into());
        self
    }
}

/// Adapter turning a typed async fn into an erased [`TaskHandler`].
struct FnHandler<A, F> {
    f: F,
    _args: PhantomData<fn(A)>,
}

#[async_trait]
impl<A, F, Fut> TaskHandler for FnHandler<A, F>
where
    A: DeserializeOwned + Send,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn call(&self, args: Value) -> HandlerResult {
        // An argument-shape mismatch cannot be fixed by redelivery.
        let typed: A = serde_json::from_value(args)
            .map_err(|e| TaskFailure::Permanent(format!("argument shape mismatch: {e}")))?;
        (self.f)(typed).await
    }
}

/// Process-wide mapping from task name to handler.
///
/// Registration happens once at startup; afterwards the router is shared
/// immutably (`Arc<TaskRouter>`) between publisher-side invocation building
/// and worker-side dispatch.
pub struct TaskRouter {
    tasks: HashMap<String, TaskDefinition>,
}

impl TaskRouter {
    pub fn new() -> Self {
        TaskRouter {
            tasks: HashMap::new(),
        }
    }

    /// Register an erased handler under a unique name.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(QueueError::DuplicateTaskName(name));
        }
        self.tasks.insert(
            name.clone(),
            TaskDefinition { name, handler },
        );
        Ok(())
    }

    /// Register a typed async fn; its argument is decoded from the envelope
    /// body before the call.
    pub fn register_fn<A, F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(
            name,
            Arc::new(FnHandler {
                f,
                _args: PhantomData,
            }),
        )
    }

    /// Build an invocation for a registered task.
    ///
    /// The name is checked here, at build time, so a producer-side typo
    /// surfaces immediately instead of dead-lettering on a remote consumer.
    pub fn invocation<A: Serialize>(&self, name: &str, args: &A) -> Result<TaskInvocation> {
        if !self.tasks.contains_key(name) {
            return Err(QueueError::UnknownTask(name.to_string()));
        }
        let args = serde_json::to_value(args).map_err(|e| QueueError::Encode(e.to_string()))?;
        Ok(TaskInvocation {
            task_name: name.to_string(),
            args,
            backend_override: None,
            queue_override: None,
        })
    }

    /// Resolve a task name and run its handler. Handler invocation is the
    /// router's only side effect; retry policy lives with the caller.
    pub async fn dispatch(&self, task_name: &str, args: Value) -> Result<HandlerResult> {
        let definition = self
            .tasks
            .get(task_name)
            .ok_or_else(|| QueueError::UnknownTask(task_name.to_string()))?;
        Ok(definition.handler.call(args).await)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.values().map(|t| t.name()).collect()
    }
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn router_with_add() -> TaskRouter {
        let mut router = TaskRouter::new();
        router
            .register_fn("add", |args: AddArgs| async move {
                Ok(Value::from(args.a + args.b))
            })
            .unwrap();
        router
    }

    #[test]
    fn test_duplicate_task_name() {
        let mut router = router_with_add();
        let err = router
            .register_fn("add", |_: AddArgs| async { Ok(Value::Null) })
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateTaskName(name) if name == "add"));
    }

    #[test]
    fn test_invocation_unknown_task() {
        let router = router_with_add();
        let err = router.invocation("missing", &json!({})).unwrap_err();
        assert!(matches!(err, QueueError::UnknownTask(name) if name == "missing"));
    }

    #[test]
    fn test_invocation_overrides() {
        let router = router_with_add();
        let invocation = router
            .invocation("add", &json!({"a": 1, "b": 2}))
            .unwrap()
            .with_backend("yaml")
            .with_queue("other");

        assert_eq!(invocation.task_name, "add");
        assert_eq!(invocation.backend_override.as_deref(), Some("yaml"));
        assert_eq!(invocation.queue_override.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_dispatch_runs_handler() {
        let router = router_with_add();
        let outcome = router
            .dispatch("add", json!({"a": 40, "b": 2}))
            .await
            .unwrap();
        assert_eq!(outcome.unwrap(), Value::from(42));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_task() {
        let router = router_with_add();
        let err = router.dispatch("missing", Value::Null).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownTask(_)));
    }

    #[tokio::test]
    async fn test_argument_mismatch_is_permanent() {
        let router = router_with_add();
        let outcome = router
            .dispatch("add", json!({"a": "not a number"}))
            .await
            .unwrap();
        assert!(matches!(outcome, Err(TaskFailure::Permanent(_))));
    }

    #[tokio::test]
    async fn test_handler_failure_classification_passes_through() {
        let mut router = TaskRouter::new();
        router
            .register_fn("flaky", |_: Value| async {
                Err(TaskFailure::Transient("downstream timeout".to_string()))
            })
            .unwrap();

        let outcome = router.dispatch("flaky", Value::Null).await.unwrap();
        assert_eq!(
            outcome.unwrap_err(),
            TaskFailure::Transient("downstream timeout".to_string())
        );
    }
}
