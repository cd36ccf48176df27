use std::time::Duration;

use anyhow::{Context, Result};
use machine_dispatch::{execute_job, Address, Config, JsonRpc};
use serde_json::Value;

/// Used when neither the command line nor the config sets a deadline.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn main(
    config: &Config,
    address: &Address,
    method: &str,
    params: Option<&str>,
    timeout: Option<f64>,
    heartbeat_timeout: Option<f64>,
) -> Result<()> {
    let params: Option<Value> = params
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("params must be valid JSON")?;

    let timeout = match timeout {
        Some(secs) => Some(Duration::try_from_secs_f64(secs).context("invalid --timeout")?),
        None => config.runner.timeout().or(Some(DEFAULT_TIMEOUT)),
    };
    let heartbeat_timeout = match heartbeat_timeout {
        Some(secs) => Some(Duration::try_from_secs_f64(secs).context("invalid --heartbeat-timeout")?),
        None => config.runner.heartbeat_timeout(),
    };

    let engine = JsonRpc::new(address.connect().await?);
    let running = tokio::spawn(engine.clone().run());

    let job = engine.request(method, params);
    let result = execute_job(&job, timeout, heartbeat_timeout).await;

    engine.close().await;
    if let Err(error) = running.await {
        tracing::debug!(error = format!("{:?}", error), "read loop ended abnormally");
    }

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
