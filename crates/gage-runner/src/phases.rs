use gage_store::Phase;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEvent {
    Started { run_id: String, phase: Phase },
    Progress { run_id: String, phase: Phase, ratio: f64 },
    Finished { run_id: String, phase: Phase, exit_code: Option<i32> },
}

/// Fan-out channel for lifecycle events. Subscribers whose receiver was
/// dropped are pruned on the next publish.
#[derive(Debug, Clone, Default)]
pub struct PhaseBus {
    subscribers: Arc<Mutex<Vec<Sender<PhaseEvent>>>>,
}

impl PhaseBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<PhaseEvent> {
        let (tx, rx) = channel();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: PhaseEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<PhaseEvent>>> {
        match self.subscribers.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
