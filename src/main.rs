use std::env;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use dicelog::PipelineConfig;
use dicelog::dice::{self, DiceState, ThreadRoller};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

fn config_from_env() -> Result<PipelineConfig, Box<dyn Error + Send + Sync>> {
    let endpoint = env::var("DICELOG_OTLP_ENDPOINT")
        .map_err(|_| "DICELOG_OTLP_ENDPOINT must be set to the collector host or URL")?;
    let token = env::var("DICELOG_OTLP_TOKEN")
        .map_err(|_| "DICELOG_OTLP_TOKEN must be set to the log shipping token")?;

    let mut config = PipelineConfig::new(endpoint, token);
    if let Ok(user_agent) = env::var("DICELOG_USER_AGENT") {
        config = config.with_user_agent(user_agent);
    }
    if let Ok(service_name) = env::var("DICELOG_SERVICE_NAME") {
        config = config.with_service_name(service_name);
    }
    Ok(config)
}

pub fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let listen_addr =
        env::var("DICELOG_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_owned());

    // Built outside the runtime: the remote sink owns a blocking HTTP client.
    let pipeline = dicelog::setup(config_from_env()?)?;
    let shutdown = pipeline.shutdown_hook();
    let state = DiceState::new(pipeline.logger(dice::SCOPE_NAME), Arc::new(ThreadRoller));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
        tracing::info!(addr = %listen_addr, "serving /rolldice");
        axum::serve(listener, dice::router(state))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
    });
    drop(runtime);

    shutdown(Duration::from_secs(5))?;
    served?;
    Ok(())
}
