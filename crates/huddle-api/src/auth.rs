use std::sync::Arc;

use huddle_gateway::ChatService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub service: ChatService,
    /// Shared with the auth service that issues tokens
    pub jwt_secret: Arc<str>,
}

impl AppStateInner {
    pub fn new(service: ChatService, jwt_secret: Arc<str>) -> AppState {
        Arc::new(Self { service, jwt_secret })
    }
}
