use std::sync::Arc;
use std::time::Duration;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerClient;
use crate::error::{AgentError, Result};
use crate::protocol::PendingTasks;
use crate::session::reporter::{Reporter, Route};
use crate::tasks::Dispatcher;

/// Why the polling loop returned.
#[derive(Debug)]
pub enum PollExit {
    Shutdown,
    /// Time to try the WebSocket again
    Upgrade,
    /// The controller could not be reached or answered non-2xx
    TransportFailed(AgentError),
}

/// Lets other HTTP users (the heartbeat) tell a running poll loop that the
/// controller is unreachable.
///
/// Only a loop that is currently polling is woken; nothing is remembered for
/// later loops.
#[derive(Debug, Clone, Default)]
pub struct TransportFault {
    notify: Arc<Notify>,
}

impl TransportFault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.notify.notify_waiters();
    }

    /// Resolves on the next `raise`. Registered as soon as it is created.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

/// HTTP fallback transport: asks the controller for pending work on a fixed
/// interval.
pub struct Poller {
    client: ControllerClient,
    dispatcher: Dispatcher,
    reporter: Reporter,
    interval: Duration,
    fault: TransportFault,
}

impl Poller {
    pub fn new(
        client: ControllerClient,
        dispatcher: Dispatcher,
        reporter: Reporter,
        interval: Duration,
        fault: TransportFault,
    ) -> Self {
        Self {
            client,
            dispatcher,
            reporter,
            interval,
            fault,
        }
    }

    /// Poll until shutdown, a transport failure (own or raised through the
    /// [`TransportFault`]), or `upgrade_after` elapses.
    pub async fn run(&self, shutdown: &CancellationToken, upgrade_after: Option<Duration>) -> PollExit {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let upgrade = async {
            match upgrade_after {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(upgrade);

        let fault = self.fault.notified();
        tokio::pin!(fault);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return PollExit::Shutdown,
                _ = &mut fault => {
                    return PollExit::TransportFailed(AgentError::Transport(
                        "controller unreachable from heartbeat".to_string(),
                    ));
                }
                _ = &mut upgrade => return PollExit::Upgrade,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        return PollExit::TransportFailed(e);
                    }
                }
            }
        }
    }

    /// One request for pending work. Returns how many tasks were dispatched.
    pub async fn poll_once(&self) -> Result<usize> {
        match self.client.pending_tasks().await? {
            PendingTasks::Tasks(tasks) => {
                let count = tasks.len();
                if count > 0 {
                    tracing::info!(count, "Received pending tasks");
                }
                for task in tasks {
                    let reporter = self.reporter.clone();
                    self.dispatcher.spawn(task, move |outcome| async move {
                        reporter.report(outcome, Route::Poll).await;
                    });
                }
                Ok(count)
            }
            PendingTasks::Rejected(reason) => {
                tracing::warn!(reason = %reason, "Controller rejected pending tasks request");
                Ok(0)
            }
        }
    }
}
