use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::config::CrawlerConfig;
use crate::crawler::orchestrator::Orchestrator;
use crate::crawler::task::{CrawlTask, TaskId, TaskStatus};
use crate::index::SearchMode;
use crate::storage::frontier_store::FrontierStoreFactory;

fn load_config(profile: Option<&str>) -> Result<CrawlerConfig> {
    match profile {
        Some(name) => {
            CrawlerConfig::load_profile(name).context(format!("Failed to load profile: {name}"))
        }
        None => CrawlerConfig::load_default(),
    }
}

fn print_task(task: &CrawlTask) {
    println!("Task ID: {}", task.id);
    println!("Status: {}", task.status);
    println!(
        "Jobs: {} queued, {} succeeded, {} failed, {} skipped",
        task.counters.queued, task.counters.succeeded, task.counters.failed, task.counters.skipped
    );
    println!("Limits: depth <= {}, pages <= {}", task.max_depth, task.max_pages);
    println!("Created: {}", task.created_at);
    println!("Last Updated: {}", task.updated_at);

    if !task.failure_kinds.is_empty() {
        println!("Failures by kind:");
        for (kind, count) in &task.failure_kinds {
            println!("  - {kind}: {count}");
        }
    }
}

/// Submit a crawl task and drive it to a terminal state in-process.
pub async fn crawl(
    urls: Vec<String>,
    profile: Option<String>,
    depth: Option<u32>,
    limit: Option<u32>,
) -> Result<()> {
    let config = load_config(profile.as_deref())?;

    let orchestrator = Orchestrator::from_config(config).await?;
    let recovered = orchestrator.recover().await?;
    if recovered > 0 {
        info!(jobs = recovered, "resuming jobs left over from a previous run");
    }
    orchestrator.start().await;

    let task_id = orchestrator.submit(urls, depth, limit).await?;
    info!("Crawl task started with ID: {task_id}");
    info!("Use `crawler status {task_id}` to check it from another terminal");

    let poll = Duration::from_millis(250);
    let task = tokio::select! {
        result = orchestrator.wait_until_settled(task_id, poll) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, cancelling task");
            orchestrator.cancel(task_id).await?;
            orchestrator.wait_until_settled(task_id, poll).await?
        }
    };

    orchestrator.shutdown().await;

    print_task(&task);
    let metrics = orchestrator.metrics().await;
    println!(
        "Fetches: {} total, {} ok, {} failed, {} bytes, avg {} ms",
        metrics.fetches_total,
        metrics.fetches_succeeded,
        metrics.fetches_failed,
        metrics.bytes_fetched,
        metrics.avg_fetch_millis()
    );
    println!("Pages stored: {}", orchestrator.page_count().await?);

    Ok(())
}

/// Show the persisted snapshot of a task, from any process.
pub async fn status(task_id: String) -> Result<()> {
    let id: TaskId = task_id.parse().context("Invalid task id")?;
    let config = CrawlerConfig::load_default()?;
    let store = FrontierStoreFactory::create(&config.storage.frontier).await?;

    match store.get_task(id).await? {
        Some(task) => print_task(&task),
        None => println!("Task not found: {task_id}"),
    }
    Ok(())
}

/// List persisted tasks, newest first.
pub async fn tasks(status: Option<String>, limit: usize) -> Result<()> {
    let filter: Option<TaskStatus> = status
        .map(|s| s.parse().map_err(|e: String| anyhow::anyhow!(e)))
        .transpose()?;

    let config = CrawlerConfig::load_default()?;
    let store = FrontierStoreFactory::create(&config.storage.frontier).await?;

    let mut all = store.list_tasks().await?;
    all.retain(|t| filter.map_or(true, |f| t.status == f));
    all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    all.truncate(limit);

    if all.is_empty() {
        println!("No tasks found");
        return Ok(());
    }
    for task in all {
        println!(
            "{}  {:<9}  ok={} failed={} skipped={}  {}",
            task.id,
            task.status.to_string(),
            task.counters.succeeded,
            task.counters.failed,
            task.counters.skipped,
            task.created_at
        );
    }
    Ok(())
}

/// Relay a query to the configured index collaborators.
pub async fn search(query: String, mode: String, limit: usize) -> Result<()> {
    let mode: SearchMode = mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let config = CrawlerConfig::load_default()?;
    let orchestrator = Orchestrator::from_config(config).await?;

    let hits = orchestrator.search(&query, mode, limit).await?;
    if hits.is_empty() {
        println!("No results for '{query}'");
    } else {
        for hit in hits {
            println!("{:.3}  {}", hit.score, hit.url);
        }
    }
    orchestrator.shutdown().await;
    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {profile}");
    }
    Ok(())
}

/// Show or create a configuration profile
pub async fn manage_profile(profile_name: String) -> Result<()> {
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {profile_name}");
            println!("{config:#?}");
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {profile_name}");
        }
    }
    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration:");
    println!("{config:#?}");
    Ok(())
}
