use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{HpnlError, Result};
use crate::service::EventQueueService;

const THREAD_NAME: &str = "hpnl-event-loop";

/// The thread that polls a service's active event queues.
///
/// Each iteration snapshots the active queues, waits up to the configured
/// poll timeout for completions, dispatches them in transport order and then
/// drains the reap queue.
pub struct EventPollingLoop {
    handle: JoinHandle<Result<()>>,
}

impl EventPollingLoop {
    pub(crate) fn spawn(service: Arc<EventQueueService>) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || run(&service))
            .map_err(|err| HpnlError::LoopTerminated(format!("cannot spawn event loop: {err}")))?;
        Ok(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(HpnlError::LoopTerminated("event loop panicked".into())))
    }
}

fn run(service: &EventQueueService) -> Result<()> {
    let config = service.config();
    let timeout = config.poll_timeout();
    let max = config.max_completions_per_poll;
    let transport = Arc::clone(service.transport());
    let mut queues = Vec::new();
    let mut completions = Vec::with_capacity(max);

    tracing::info!(poll_timeout_ms = config.poll_timeout_ms, "event loop started");
    while !service.stop_requested() {
        service.snapshot_active(&mut queues);
        completions.clear();
        if let Err(err) = transport.poll(&queues, timeout, max, &mut completions) {
            if err.is_fatal() {
                let reason = err.to_string();
                tracing::error!(error = %err, "event loop terminated");
                service.loop_exited(Some(reason.clone()));
                return Err(HpnlError::LoopTerminated(reason));
            }
            tracing::warn!(error = %err, "poll failed");
        }
        for completion in completions.drain(..) {
            service.handle_completion(completion);
        }
        service.process_external_events();
    }

    service.process_external_events();
    service.loop_exited(None);
    tracing::info!("event loop stopped");
    Ok(())
}
