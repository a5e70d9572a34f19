//! Published engine state
//!
//! The engine is the only writer. Front ends subscribe and read, never write.

use crate::models::{Mode, ResultCurve};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle phase of the measurement engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Armed(Mode),
    Recording(Mode),
    Stopping(Mode),
    Analyzing,
}

impl EngineState {
    /// Whether a capture/playback pair exists or is being set up or torn down
    pub fn is_session_active(&self) -> bool {
        matches!(
            self,
            EngineState::Armed(_) | EngineState::Recording(_) | EngineState::Stopping(_)
        )
    }
}

/// Writer side, owned by the engine
pub(crate) struct PublishedState {
    phase: watch::Sender<EngineState>,
    running: watch::Sender<bool>,
    curve: watch::Sender<Arc<ResultCurve>>,
}

impl PublishedState {
    pub fn new() -> Self {
        Self {
            phase: watch::Sender::new(EngineState::Idle),
            running: watch::Sender::new(false),
            curve: watch::Sender::new(Arc::new(ResultCurve::default())),
        }
    }

    pub fn subscribe(&self) -> StateSubscriber {
        StateSubscriber {
            phase: self.phase.subscribe(),
            running: self.running.subscribe(),
            curve: self.curve.subscribe(),
        }
    }

    pub fn phase(&self) -> EngineState {
        *self.phase.borrow()
    }

    pub fn set_phase(&self, state: EngineState) {
        let previous = self.phase.send_replace(state);
        if previous != state {
            log::debug!("Engine {:?} -> {:?}", previous, state);
        }
    }

    pub fn running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn set_running(&self, running: bool) {
        self.running.send_if_modified(|current| {
            let changed = *current != running;
            *current = running;
            changed
        });
    }

    pub fn curve(&self) -> Arc<ResultCurve> {
        self.curve.borrow().clone()
    }

    /// Replace the curve wholesale
    pub fn publish_curve(&self, curve: Arc<ResultCurve>) {
        self.curve.send_replace(curve);
    }
}

/// Read-only view of the engine for front ends
#[derive(Clone)]
pub struct StateSubscriber {
    phase: watch::Receiver<EngineState>,
    running: watch::Receiver<bool>,
    curve: watch::Receiver<Arc<ResultCurve>>,
}

impl StateSubscriber {
    pub fn phase(&self) -> EngineState {
        *self.phase.borrow()
    }

    /// True for the whole Recording + Stopping window
    pub fn measurement_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn result_curve(&self) -> Arc<ResultCurve> {
        self.curve.borrow().clone()
    }

    /// Wait until no session is running
    pub async fn wait_until_idle(&mut self) {
        // An engine that was dropped has no session either
        let _ = self.running.wait_for(|running| !running).await;
    }
}
