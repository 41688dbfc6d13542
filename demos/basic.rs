use std::time::Duration;

use tenantcall_http::{
    ApiKeyHeader, CallRequest, HookSettings, Orchestrator, OrchestratorOptions,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenantcall_http=debug".into()),
        )
        .init();

    let options = OrchestratorOptions::from_env()?;
    let api_key = std::env::var("TENANTCALL_API_KEY")?;

    let api = Orchestrator::builder()
        .provider("demo")
        .options(options)
        .auth(ApiKeyHeader::new("x-api-key", api_key))
        .hook(429, HookSettings::retry().max_retries(3))
        .hook(
            503,
            HookSettings::retry()
                .max_retries(2)
                .max_delay(Duration::from_secs(5)),
        )
        .build()?;

    let response = api
        .call(
            CallRequest::get("/v1/items")
                .account("tenant-1")
                .query("limit", "10")
                .cache_time_ms(30_000),
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&response.body)?);

    let state = api.account_state("tenant-1");
    println!(
        "last call failed: {}, at: {:?}",
        state.last_request_failed, state.last_request_time
    );

    Ok(())
}
