//! Employee API load test: ramping reads against a constant stream of writes.
//!
//! ```text
//! $ cargo run -p mock-service &
//! $ cargo run -p demos -- -c demos/employee-plan.json
//! ```
use rand::{distributions::Alphanumeric, Rng};
use reqwest::Client;
use serde_json::json;
use std::process::ExitCode;
use std::sync::OnceLock;
use std::time::Duration;
use surge::prelude::*;
use surge_runtime::SurgeRuntime;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("surge=info")),
        )
        .init();

    let mut registry = Registry::new();
    registry
        .register("read_employees", read_employees)
        .register("create_employee", create_employee);

    SurgeRuntime::new(registry).with_args().run().await
}

static CLIENT: OnceLock<Client> = OnceLock::new();

async fn read_employees() -> anyhow::Result<()> {
    get_employees().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

async fn create_employee() -> anyhow::Result<()> {
    let clerk_id = format!("test_user_{}", random_suffix());
    post_employee(clerk_id).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}

#[transaction(metric = "http_req", tags(type = "read"))]
async fn get_employees() -> anyhow::Result<reqwest::Response> {
    let client = CLIENT.get_or_init(Client::new);
    Ok(client.get(base_url().join("employee")?).send().await?)
}

#[transaction(metric = "http_req", tags(type = "write"))]
async fn post_employee(clerk_id: String) -> anyhow::Result<reqwest::Response> {
    let client = CLIENT.get_or_init(Client::new);
    let body = json!({
        "clerkId": clerk_id,
        "firstName": "Test",
        "lastName": "User",
        "email": format!("{clerk_id}@example.com"),
        "estado": "pendiente",
    });
    Ok(client
        .post(base_url().join("employee/")?)
        .json(&body)
        .send()
        .await?)
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
