use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub hub: Arc<Hub>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            hub: Arc::new(Hub::new()),
            start_time: Instant::now(),
        }
    }
}
