//! Build commands.

use anyhow::{Context, Result};
use buildfarm_core::build::{Build, BuildSpec};
use buildfarm_core::job::Job;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;

use super::ApiClient;

#[derive(Debug, Deserialize)]
struct Queued {
    build_id: i64,
    job_id: i64,
    score: i32,
}

pub async fn queue(api: &ApiClient, spec_path: &Path, requested_by: Option<String>) -> Result<()> {
    let content = std::fs::read_to_string(spec_path)
        .with_context(|| format!("Failed to read build spec: {}", spec_path.display()))?;
    let spec: BuildSpec = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse build spec: {}", spec_path.display()))?;

    let queued: Queued = api
        .post(
            "/builds",
            &json!({ "spec": spec, "requested_by": requested_by }),
        )
        .await?;
    println!(
        "Queued build {} as job {} (score {})",
        queued.build_id, queued.job_id, queued.score
    );
    Ok(())
}

pub async fn cancel(api: &ApiClient, id: i64) -> Result<()> {
    let build: Build = api
        .post(&format!("/builds/{}/cancel", id), &json!({}))
        .await?;
    println!("Build {} is {}", build.id, build.status);
    Ok(())
}

pub async fn retry(api: &ApiClient, id: i64) -> Result<()> {
    let job: Job = api
        .post(&format!("/builds/{}/retry", id), &json!({}))
        .await?;
    println!("Build {} requeued as job {} (score {})", id, job.id, job.score);
    Ok(())
}
