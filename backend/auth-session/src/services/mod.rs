/// Service layer
pub mod auth_session;
pub mod reaper;

pub use auth_session::AuthSessionService;
pub use reaper::{ReapReport, Reaper};
