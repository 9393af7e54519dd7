use crate::scheduler::DetectionRunner;
use crate::storage::SqliteStore;

#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
    pub runner: DetectionRunner,
}

impl AppState {
    /// State whose runner shares `store`.
    pub fn new(runner: DetectionRunner) -> Self {
        Self {
            store: runner.store().clone(),
            runner,
        }
    }
}
