//! Delayed fan shutoff.
//!
//! At most one shutoff is pending. Scheduling a new one aborts the old timer
//! outright; an unfired timer has no writes in flight. A fired timer does not
//! touch the peripheral itself, it posts a [`ShutoffDue`] back to the session
//! loop, which runs the writes in line with command traffic.

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use volcano_common::ShutoffAction;

/// Fired timer, tagged with the generation it was scheduled under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutoffDue {
    generation: u64,
}

#[derive(Debug)]
struct Pending {
    generation: u64,
    action: ShutoffAction,
    task: JoinHandle<()>,
}

#[derive(Debug)]
pub struct ShutoffScheduler {
    pending: Option<Pending>,
    generation: u64,
    due_tx: mpsc::UnboundedSender<ShutoffDue>,
}

impl ShutoffScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ShutoffDue>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            pending: None,
            generation: 0,
            due_tx,
        };
        (scheduler, due_rx)
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Replaces any pending shutoff with `action`.
    pub fn schedule(&mut self, action: ShutoffAction) {
        if self.cancel() {
            info!("replaced pending fan shutoff");
        }

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let delay = action.delay;
        let due_tx = self.due_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = due_tx.send(ShutoffDue { generation });
        });

        info!(
            "fan shutoff in {:.1}s (heat off: {}, screen off: {}, animation: {:?})",
            delay.as_secs_f64(),
            action.turn_off_heat,
            action.turn_off_screen,
            action.animation.and_then(|request| request.pattern),
        );
        self.pending = Some(Pending {
            generation,
            action,
            task,
        });
    }

    /// Abandons the pending shutoff, if any. Returns whether one was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                debug!("fan shutoff generation {} cancelled", pending.generation);
                true
            }
            None => false,
        }
    }

    /// Claims the action for a fired timer. Returns `None` when the timer was
    /// superseded after it fired but before the session loop got to it.
    pub fn take_due(&mut self, due: ShutoffDue) -> Option<ShutoffAction> {
        let current = self.pending.as_ref().map(|pending| pending.generation);
        if current == Some(due.generation) {
            return self.pending.take().map(|pending| pending.action);
        }
        debug!("dropping stale fan shutoff generation {}", due.generation);
        None
    }
}

impl Drop for ShutoffScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
