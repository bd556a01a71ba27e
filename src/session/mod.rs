//! Terminal session management.

mod models;
mod repository;
mod service;

pub use models::{
    RelationType, SessionStatus, StartOptions, StartOutcome, StopOutcome, TerminalSession,
    container_name_for,
};
pub use repository::SessionRepository;
pub use service::{SessionService, SessionServiceConfig};
