//! Job commands.

use anyhow::Result;
use buildfarm_core::job::Job;
use serde_json::json;

use super::ApiClient;

pub async fn rescore(api: &ApiClient, id: i64, score: i32) -> Result<()> {
    let job: Job = api
        .post(&format!("/jobs/{}/score", id), &json!({ "score": score }))
        .await?;
    println!("Job {} now scores {}", job.id, job.score);
    Ok(())
}
