use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use locllm_service::{AppConfig, InferenceEngine, ModelManager, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(model = %config.model_name_short, "resolving model config");

    let manager = Arc::new(ModelManager::from_config(
        &config.model_name_short,
        Some(&config.model_source),
        build_engine()?,
        config.reload_policy,
    )?);
    let router = build_router(config.clone(), manager.clone());

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready, model loading in background");

    // Requests are answered with 503 until the load completes; a failed
    // load stops the server.
    let serve = async {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(anyhow::Error::from)
    };
    let load = async {
        manager.load().await?;
        tracing::info!(model = manager.model_name_short(), "model ready");
        Ok::<_, anyhow::Error>(())
    };
    tokio::try_join!(serve, load)?;

    manager.unload().await;
    Ok(())
}

#[cfg(feature = "tch-backend")]
fn build_engine() -> anyhow::Result<Arc<dyn InferenceEngine>> {
    Ok(Arc::new(locllm_service::model::torch::TorchEngine::from_env()))
}

#[cfg(not(feature = "tch-backend"))]
fn build_engine() -> anyhow::Result<Arc<dyn InferenceEngine>> {
    anyhow::bail!("built without an inference backend; rebuild with `--features tch-backend`")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
