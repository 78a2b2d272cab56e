//! Selenite daemon entry point.
//!
//! Boot order mirrors the component dependency chain: tracing first, then
//! the data directories, the service graph (store → gateways → registry →
//! scheduler), registry bootstrap from the models directory, startup
//! recovery, and finally signal-driven shutdown. The HTTP layer mounts on
//! top of `SeleniteService`; this binary is the host process.

use std::path::PathBuf;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use selenite_core::engine::stub::{ScriptedAsrEngine, ScriptedDiarizer};
use selenite_core::{
    EngineCatalog, ModelKind, SeleniteError, SeleniteService, ServiceConfig, Tunables,
};

fn data_dir() -> PathBuf {
    std::env::var_os("SELENITE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./selenite-data"))
}

fn models_dir(data: &std::path::Path) -> PathBuf {
    std::env::var_os("SELENITE_MODELS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| data.join("models"))
}

/// Engine implementations available in this build.
///
/// The scripted engines stand in until native backends are wired up; they
/// exercise the full queue/executor path with deterministic output.
fn build_catalog() -> EngineCatalog {
    let mut catalog = EngineCatalog::new();
    catalog.register_asr(std::sync::Arc::new(ScriptedAsrEngine::new("whisper")));
    catalog.register_diarizer(std::sync::Arc::new(ScriptedDiarizer::new("pyannote")));
    catalog
}

/// Register any `<models>/<provider>/<weight>/` directories that are on disk
/// but not yet in the registry. The kind comes from whichever engine family
/// claims the provider name; directories no engine knows are skipped. Admin
/// edits through the API win; this only fills gaps.
fn bootstrap_registry(service: &SeleniteService, models_root: &std::path::Path) -> anyhow::Result<()> {
    let registry = service.registry();
    let catalog = service.catalog();
    let Ok(providers) = std::fs::read_dir(models_root) else {
        return Ok(());
    };
    for provider_entry in providers.flatten() {
        if !provider_entry.path().is_dir() {
            continue;
        }
        let provider = provider_entry.file_name().to_string_lossy().into_owned();
        let kind = if catalog.has_asr(&provider) {
            ModelKind::Asr
        } else if catalog.has_diarizer(&provider) {
            ModelKind::Diarizer
        } else {
            info!(provider, "skipping model directory without an engine");
            continue;
        };
        let set_id = match registry.create_set(kind, &provider, &provider_entry.path(), None) {
            Ok(id) => id,
            Err(SeleniteError::DuplicateName(_)) => registry
                .list(kind)?
                .into_iter()
                .find(|s| s.name == provider)
                .map(|s| s.id)
                .context("registry set vanished during bootstrap")?,
            Err(err) => return Err(err.into()),
        };

        let Ok(weights) = std::fs::read_dir(provider_entry.path()) else {
            continue;
        };
        for weight_entry in weights.flatten() {
            if !weight_entry.path().is_dir() {
                continue;
            }
            let weight = weight_entry.file_name().to_string_lossy().into_owned();
            match registry.create_weight(set_id, &weight, &weight_entry.path(), None) {
                Ok(_) => info!(provider, weight, "registered weight from disk"),
                Err(SeleniteError::DuplicateName(_)) => {}
                Err(err) => warn!(provider, weight, error = %err, "could not register weight"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("selenite=info")),
        )
        .init();

    let data = data_dir();
    let models = models_dir(&data);
    std::fs::create_dir_all(&models).context("create models directory")?;
    info!(data = %data.display(), models = %models.display(), "selenite starting");

    let service = SeleniteService::new(
        ServiceConfig {
            db_path: data.join("selenite.db"),
            storage_root: data.join("storage"),
            models_root: models.clone(),
            tunables: Tunables::from_env(),
        },
        build_catalog(),
    )
    .context("build service")?;

    bootstrap_registry(&service, &models)?;
    service.start().context("start service")?;

    match service.list_availability() {
        Ok(report) => {
            let available = report.asr.iter().filter(|p| p.available).count();
            info!(
                asr_providers = report.asr.len(),
                asr_available = available,
                diarizer_weights = report.diarizers.len(),
                "availability probed"
            );
            for provider in &report.asr {
                for note in &provider.notes {
                    info!(provider = %provider.provider, note = %note, "availability note");
                }
            }
        }
        Err(err) => warn!(error = %err, "availability probe failed"),
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown signal received");
    service.stop();
    Ok(())
}
