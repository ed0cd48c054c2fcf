//! Outreach resilience inspector
//!
//! Loads the policy configuration (optional YAML path argument, `.env`, `OUTREACH__*`
//! variables), logs the effective per-dependency policies and prints them as JSON.

use outreach::{HealthReport, OutreachConfig, init_tracing};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let path = std::env::args().nth(1);
    let config = OutreachConfig::load(path.as_deref())?;

    init_tracing(&config.log_level);
    let invoker = config.build_invoker();

    for (name, policy) in config.policies() {
        tracing::info!(
            dependency = %name,
            failure_threshold = policy.breaker.failure_threshold,
            open_timeout_ms = policy.breaker.open_timeout.as_millis() as u64,
            rate_limited = policy.rate_limit.is_some(),
            max_retries = policy.retry.max_retries,
            "policy_loaded"
        );
    }

    let policies: serde_json::Map<String, serde_json::Value> = config
        .policies()
        .into_iter()
        .map(|(name, policy)| Ok((name, serde_json::to_value(policy)?)))
        .collect::<Result<_, serde_json::Error>>()?;

    let output = serde_json::json!({
        "name": config.name,
        "defaults": config.defaults,
        "policies": policies,
        "health": HealthReport::collect(&invoker),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
