use anyhow::{bail, Result};
use clap::Parser;
use facerec_core::{DynamicTemplateIndex, FacerecService, Method, Value};
use serde_json::json;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod database;
mod engine;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    tracing::info!(version = FacerecService::version(), ?config, "facerec-service starting");

    let service = FacerecService::new(config.model_dir());
    let (engine, method) = engine::Engine::from_config(&service, &config)?;
    let engine = engine::spawn_engine(engine)?;

    let index = open_index(&service, &config, &method)?;
    if let Some(path) = &config.templates_path {
        database::enroll_templates_file(&index, path)?;
    }
    if let Some(dir) = &config.images_path {
        let images = database::collect_images(dir)?;
        database::enroll_images(&engine, &index, &images, config.max_license_count).await?;
    }
    if let Some(path) = &config.save_index {
        index.save(path, config.overwrite_index)?;
        tracing::info!(path = %path.display(), "template index saved");
    }

    let app = api::router(api::AppState::new(engine, index));
    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "facerec-service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facerec-service shutting down");
    Ok(())
}

/// Saved index from `--index-path`, or an empty one bound to the extractor's method.
fn open_index(service: &FacerecService, config: &Config, method: &Method) -> Result<DynamicTemplateIndex> {
    let index = match &config.index_path {
        Some(path) => {
            let index = service.load_dynamic_template_index(path)?;
            let saved = index.method()?;
            if &saved != method {
                bail!(
                    "saved index at {} holds {saved} templates but the extractor produces {method}",
                    path.display()
                );
            }
            index
        }
        None => service.create_dynamic_template_index(&Value::from(json!({
            "capacity": config.capacity,
            "max_license_count": config.max_license_count,
            "modification": method.name.as_str(),
            "version": method.version,
        })))?,
    };
    tracing::info!(
        method = %method,
        size = index.size()?,
        capacity = index.capacity()?,
        "template index ready"
    );
    Ok(index)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
