//! Resource models served by the concrete caches.

pub mod project;
pub mod user;

pub use project::{Project, ProjectStatus};
pub use user::{User, UserStatus};
