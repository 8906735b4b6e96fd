//! Concrete resource caches.
//!
//! Each cache is a `StateCache` specialised with a loader that knows how to
//! read one resource type from its `ResourceSource`.

pub mod models;
mod projects;
mod source;
mod users;

pub use models::*;
pub use projects::{ProjectCache, ProjectLoader};
pub use source::{InMemorySource, ResourceSource};
pub use users::{UserCache, UserLoader};
