use crate::config::Config;
use crate::feedback::FeedbackServices;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub feedback: FeedbackServices,
    pub config: Config,
}
