use std::any::Any;
use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::task::TaskTracker;

use crate::protocol::{Payload, Task, TaskOutcome, DEFAULT_RESULT_KEY};
use crate::tasks::registry::HandlerRegistry;

/// Routes tasks to their handlers and turns whatever happens into a
/// [`TaskOutcome`]. Nothing a handler does (error or panic) escapes this type.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: HandlerRegistry,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            tracker: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute one task and produce its outcome.
    pub async fn dispatch(&self, task: Task) -> TaskOutcome {
        let Task {
            id,
            task_type,
            payload,
            received_at,
        } = task;

        let waited_ms = (chrono::Utc::now() - received_at).num_milliseconds().max(0);
        tracing::info!(task_id = %id, task_type = %task_type, waited_ms, "Executing task");
        let started = Instant::now();

        let outcome = match self.execute(&task_type, payload).await {
            Ok(result) => TaskOutcome::completed(id, result),
            Err(error) => TaskOutcome::failed(id, error),
        };

        match &outcome.error {
            None => tracing::info!(
                task_id = %outcome.task_id,
                task_type = %task_type,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Task completed"
            ),
            Some(error) => tracing::warn!(
                task_id = %outcome.task_id,
                task_type = %task_type,
                error = %error,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Task failed"
            ),
        }

        outcome
    }

    /// Run the handler registered for `task_type`, normalizing its result.
    ///
    /// The handler runs in its own Tokio task so a panic is reported as a join
    /// error instead of unwinding through the caller.
    pub async fn execute(&self, task_type: &str, payload: Payload) -> Result<Payload, String> {
        let handler = self
            .registry
            .get(task_type)
            .ok_or_else(|| format!("unknown task type: {}", task_type))?;

        match tokio::spawn(async move { handler.handle(payload).await }).await {
            Ok(Ok(value)) => Ok(normalize_result(value)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => Err(format!(
                "handler panicked: {}",
                panic_message(e.into_panic())
            )),
            Err(e) => Err(format!("handler cancelled: {}", e)),
        }
    }

    /// Dispatch `task` on its own Tokio task and hand the outcome to
    /// `on_outcome`. Returns immediately; there is no cap on concurrent tasks.
    pub fn spawn<F, Fut>(&self, task: Task, on_outcome: F)
    where
        F: FnOnce(TaskOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let dispatcher = self.clone();
        self.tracker.spawn(async move {
            let outcome = dispatcher.dispatch(task).await;
            on_outcome(outcome).await;
        });
    }

    /// Number of dispatched tasks that have not finished reporting.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait for in-flight tasks. Returns false if the
    /// timeout elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

/// Results that are not key/value shaped are wrapped under `"data"`.
pub fn normalize_result(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert(DEFAULT_RESULT_KEY.to_string(), other);
            map
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskStatus;
    use crate::tasks::registry::HandlerError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::builder()
            .handler_fn("echo", |payload| async move {
                Ok::<_, HandlerError>(Value::Object(payload))
            })
            .handler_fn("scalar", |_| async { Ok::<_, HandlerError>(json!("done")) })
            .handler_fn("nothing", |_| async { Ok::<_, HandlerError>(Value::Null) })
            .handler_fn("broken", |_| async {
                Err::<Value, _>(HandlerError::MissingField("container_id".to_string()))
            })
            .handler_fn("panics", |_| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<_, HandlerError>(Value::Null)
            })
            .build()
    }

    #[tokio::test]
    async fn unknown_task_type_fails_without_invoking() {
        let dispatcher = Dispatcher::new(registry());

        let outcome = dispatcher
            .dispatch(Task::new("t1", "container_explode", Payload::new()))
            .await;

        assert_eq!(outcome.task_id, "t1");
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(
            outcome.error.as_deref(),
            Some("unknown task type: container_explode")
        );
        assert!(outcome.result.is_none());
    }

    #[tokio::test]
    async fn object_result_is_kept() {
        let dispatcher = Dispatcher::new(registry());
        let payload: Payload = serde_json::from_value(json!({"output": "hi"})).unwrap();

        let outcome = dispatcher.dispatch(Task::new("t2", "echo", payload)).await;

        assert!(outcome.is_completed());
        assert_eq!(
            Value::Object(outcome.result.unwrap()),
            json!({"output": "hi"})
        );
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn scalar_and_null_results_are_normalized() {
        let dispatcher = Dispatcher::new(registry());

        let outcome = dispatcher
            .dispatch(Task::new("t3", "scalar", Payload::new()))
            .await;
        assert_eq!(Value::Object(outcome.result.unwrap()), json!({"data": "done"}));

        let outcome = dispatcher
            .dispatch(Task::new("t4", "nothing", Payload::new()))
            .await;
        assert!(outcome.is_completed());
        assert!(outcome.result.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_error_becomes_failed_outcome() {
        let dispatcher = Dispatcher::new(registry());

        let outcome = dispatcher
            .dispatch(Task::new("t5", "broken", Payload::new()))
            .await;

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("missing container_id"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let dispatcher = Dispatcher::new(registry());

        let outcome = dispatcher
            .dispatch(Task::new("t6", "panics", Payload::new()))
            .await;

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.error.unwrap().contains("handler exploded"));

        // The dispatcher keeps working after a panic.
        let outcome = dispatcher
            .dispatch(Task::new("t7", "scalar", Payload::new()))
            .await;
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn spawned_tasks_report_and_drain() {
        let dispatcher = Dispatcher::new(registry());
        let reported = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let reported = reported.clone();
            dispatcher.spawn(
                Task::new(format!("t{}", i), "echo", Payload::new()),
                move |outcome| async move {
                    assert!(outcome.is_completed());
                    reported.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        assert!(dispatcher.drain(Duration::from_secs(2)).await);
        assert_eq!(reported.load(Ordering::SeqCst), 5);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn slow_task_does_not_block_others() {
        let registry = HandlerRegistry::builder()
            .handler_fn("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, HandlerError>(Value::Null)
            })
            .handler_fn("fast", |_| async { Ok::<_, HandlerError>(json!(1)) })
            .build();
        let dispatcher = Dispatcher::new(registry);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for (id, kind) in [("slow-1", "slow"), ("fast-1", "fast")] {
            let tx = tx.clone();
            dispatcher.spawn(Task::new(id, kind, Payload::new()), move |outcome| async move {
                let _ = tx.send(outcome.task_id);
            });
        }

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("fast task should finish first");
        assert_eq!(first.as_deref(), Some("fast-1"));
        assert!(dispatcher.in_flight() >= 1);
        assert!(!dispatcher.drain(Duration::from_millis(50)).await);
    }
}
