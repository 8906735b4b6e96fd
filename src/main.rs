//! Statecache demo.
//!
//! Seeds in-memory project and user sources, then walks the cache through
//! its lifecycle: batched and coalesced loads, streaming a single key,
//! per-key failures and retry after invalidation.

use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use statecache::resources::{InMemorySource, Project, ProjectCache, ProjectLoader, User, UserCache};
use statecache::{Config, Slot, StoreRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before anything else)
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("statecache=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting statecache demo...");

    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config);

    // Backing collaborators
    let project_source =
        Arc::new(InMemorySource::new("projects").with_latency(config.source_latency));
    for id in 1..=config.demo_projects {
        let project = Project::new(id, format!("project-{id}"), format!("Project {id}"));
        project_source.insert(id, project);
    }
    for id in &config.failing_ids {
        project_source.fail(*id, "simulated outage");
    }

    let user_source = Arc::new(InMemorySource::new("users").with_latency(config.source_latency));
    user_source.insert(1, User::new(1, "admin", "Ada", "Min"));
    user_source.insert(2, User::new(2, "jdoe", "John", "Doe"));

    // One registry, one cache per resource type
    let registry = StoreRegistry::new();
    let projects = ProjectCache::new(
        ProjectLoader::new(project_source.clone()),
        &registry,
        config.cache_config(),
    );
    let users = UserCache::with_source(user_source.clone(), &registry);
    info!("Caches ready: {:?}", registry);

    let first = "1".to_string();
    let _watch = projects.subscribe(&first, |slot| log_slot("projects/1 (watch)", slot));

    // One past the seeded range to show a not-found outcome
    let keys: Vec<String> = (1..=config.demo_projects + 1).map(|id| id.to_string()).collect();

    // Overlapping requests share one batch
    futures::join!(projects.require(keys.clone()), projects.require(keys.clone()));
    info!(
        "Project source calls: {} bulk, {} single",
        project_source.many_calls(),
        project_source.one_calls()
    );
    for key in &keys {
        log_slot(&format!("projects/{key}"), &projects.get(key));
    }

    // Stream a single user until it settles
    let mut stream = users.require_and_stream(&2);
    while let Some(slot) = stream.next().await {
        log_slot("users/2 (stream)", &slot);
        if !slot.is_pristine() {
            break;
        }
    }

    // Recover the failing projects and retry them
    for id in &config.failing_ids {
        project_source.recover(*id);
        projects.invalidate(&id.to_string());
    }
    projects
        .require(config.failing_ids.iter().map(|id| id.to_string()))
        .await;

    let loaded: Vec<Project> = keys
        .iter()
        .filter_map(|key| projects.value(key))
        .map(|project| (*project).clone())
        .collect();
    info!("Loaded {} projects: {}", loaded.len(), serde_json::to_string(&loaded)?);

    registry.clear_all();
    info!("Cleared all stores, shutting down");

    Ok(())
}

fn log_slot<V: Debug>(label: &str, slot: &Slot<V>) {
    match (slot.get(), slot.error.as_deref()) {
        (_, Some(error)) => warn!("{}: error ({}), stale value: {:?}", label, error, slot.get()),
        (Some(value), None) => info!("{}: {:?}", label, value),
        (None, None) => info!("{}: not loaded", label),
    }
}
