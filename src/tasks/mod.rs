//! Task execution for work delivered by the controller.
//!
//! - **Registry**: task type -> handler, populated once at startup
//! - **Dispatcher**: runs a task against the registry and always yields an
//!   outcome, even when the handler errors or panics
//! - **Built-ins**: `echo`, `system_info` and the Docker CLI backed handlers
//!
//! # Execution Flow
//!
//! 1. A transport hands a [`Task`](crate::protocol::Task) to [`Dispatcher::spawn`]
//! 2. The dispatcher looks up the handler for `task_type`
//! 3. The handler runs on its own Tokio task
//! 4. The normalized [`TaskOutcome`](crate::protocol::TaskOutcome) goes to the reporter

pub mod builtin;
pub mod dispatcher;
pub mod registry;

pub use builtin::{builtin_handlers, DockerCli};
pub use dispatcher::Dispatcher;
pub use registry::{HandlerError, HandlerRegistry, HandlerResult, TaskHandler};
