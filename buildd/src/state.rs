use std::sync::Arc;

use engine::BuildEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BuildEngine>,
}

impl AppState {
    pub fn new(engine: BuildEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}
