//! Worker commands.

use anyhow::Result;
use buildfarm_core::worker::Worker;
use serde_json::json;

use super::ApiClient;

pub async fn list(api: &ApiClient) -> Result<()> {
    let workers: Vec<Worker> = api.get("/workers").await?;
    if workers.is_empty() {
        println!("No workers registered");
        return Ok(());
    }
    println!(
        "{:<20} {:<10} {:<6} {:<8} {:>8}  NOTES",
        "NAME", "PROCESSOR", "VIRT", "STATE", "FAILURES"
    );
    for worker in &workers {
        println!("{}", row(worker));
    }
    Ok(())
}

pub async fn disable(api: &ApiClient, name: &str, reason: &str) -> Result<()> {
    let worker: Worker = api
        .post(&format!("/workers/{}/disable", name), &json!({ "reason": reason }))
        .await?;
    println!("Disabled {}", worker.name);
    Ok(())
}

pub async fn enable(api: &ApiClient, name: &str) -> Result<()> {
    let worker: Worker = api
        .post(&format!("/workers/{}/enable", name), &json!({}))
        .await?;
    println!("Enabled {}", worker.name);
    Ok(())
}

fn state(worker: &Worker) -> &'static str {
    if !worker.active {
        "inactive"
    } else if !worker.ok {
        "disabled"
    } else if worker.manual {
        "manual"
    } else {
        "ok"
    }
}

fn row(worker: &Worker) -> String {
    format!(
        "{:<20} {:<10} {:<6} {:<8} {:>8}  {}",
        worker.name,
        worker.processor,
        if worker.virtualized { "yes" } else { "no" },
        state(worker),
        worker.failure_count,
        worker.fail_notes.as_deref().unwrap_or("")
    )
}
