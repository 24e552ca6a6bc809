use crate::types::{ScaleError, ScaleState};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, mutex::Mutex};
use std::sync::Arc;

/// Single owner of the process-wide scale simulation. Clones share the
/// same state; every read and write goes through the lock so a broadcast
/// snapshot never observes a half-applied command.
#[derive(Clone)]
pub struct StateManager {
    state: Arc<Mutex<CriticalSectionRawMutex, ScaleState>>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(ScaleState::default())
    }
}

impl StateManager {
    pub fn new(initial: ScaleState) -> Self {
        Self {
            state: Arc::new(Mutex::new(initial)),
        }
    }

    pub async fn snapshot(&self) -> ScaleState {
        let state = self.state.lock().await;
        state.clone()
    }

    /// Runs `apply` under the lock and returns the state it left behind.
    /// A failed update must leave the state untouched.
    pub async fn update<F>(&self, apply: F) -> Result<ScaleState, ScaleError>
    where
        F: FnOnce(&mut ScaleState) -> Result<(), ScaleError>,
    {
        let mut state = self.state.lock().await;
        apply(&mut state)?;
        Ok(state.clone())
    }

    pub async fn modify<F>(&self, apply: F) -> ScaleState
    where
        F: FnOnce(&mut ScaleState),
    {
        let mut state = self.state.lock().await;
        apply(&mut state);
        state.clone()
    }

    pub async fn get_display_weight(&self) -> f32 {
        let state = self.state.lock().await;
        state.display_weight()
    }
}
