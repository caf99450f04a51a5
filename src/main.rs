use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use local_llm_session::{
    AppConfig, Catalog, SessionController, build_router,
    model::InferenceEngine,
    session::CapabilityProbe,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    let catalog = match config.catalog_path.as_deref() {
        Some(path) => Catalog::load_from_path(path)?,
        None => Catalog::fallback(),
    };
    let default_model = catalog.pick(None, &config.model_id)?;
    tracing::info!(
        models = catalog.entries().len(),
        default_model = %default_model.id,
        backend_override = ?config.backend,
        model_dir = %config.model_dir.display(),
        "catalog loaded"
    );

    let (engine, probe) = engine_stack(&config)?;
    let controller = Arc::new(SessionController::new(engine, probe, config.timeouts));
    let router = build_router(config.clone(), controller, Arc::new(catalog));

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready");

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(feature = "tch-backend")]
fn engine_stack(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn InferenceEngine>, Arc<dyn CapabilityProbe>)> {
    use local_llm_session::{
        model::tch_backend::{TchEngine, TchProbe},
        session::MemoizedProbe,
    };

    let engine = TchEngine::new(config.model_dir.clone());
    Ok((Arc::new(engine), Arc::new(MemoizedProbe::new(TchProbe))))
}

#[cfg(not(feature = "tch-backend"))]
fn engine_stack(
    _config: &AppConfig,
) -> anyhow::Result<(Arc<dyn InferenceEngine>, Arc<dyn CapabilityProbe>)> {
    anyhow::bail!("no inference engine compiled in; rebuild with `--features tch-backend`")
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,local_llm_session=debug".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
