use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use canvass::config::{DedupConfig, ReviewConfig};
use canvass::domain::{Survey, User};
use canvass::memory::MemoryStore;
use canvass::store::{SurveyStore, UserStore};
use canvass_qc::{
    BatchManager, CompletionIngestor, DuplicateDetector, ReviewQueue, SessionManager, SetRotation,
};
use canvass_telephony::{ProviderDirectory, ProviderSettings, TenantConfig};
use clap::Parser;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

mod api;
mod audio;
mod state;

use audio::LocalAudioStore;
use state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
    /// Seed file with surveys, users, and tenant telephony config (JSON)
    #[arg(long)]
    seed: Option<PathBuf>,
    /// Directory for locally stored audio
    #[arg(long, default_value = "./audio-store")]
    audio_dir: PathBuf,
    /// Public base URL used when signing audio URLs
    #[arg(long, default_value = "http://localhost:8080/media/")]
    audio_base: Url,
}

/// Bootstrap data loaded at startup. Survey/user administration is handled
/// elsewhere; the pipeline only reads them.
#[derive(Debug, Default, Deserialize)]
struct Seed {
    #[serde(default)]
    surveys: Vec<Survey>,
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    tenants: Vec<TenantConfig>,
    #[serde(default)]
    providers: ProviderSettings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("canvass_service=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let args = Args::parse();
    let seed = match &args.seed {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str::<Seed>(&raw)?
        }
        None => Seed::default(),
    };

    info!(
        addr = %args.addr,
        surveys = seed.surveys.len(),
        users = seed.users.len(),
        tenants = seed.tenants.len(),
        "starting service"
    );

    let store = Arc::new(MemoryStore::new());
    for survey in seed.surveys {
        store.put_survey(survey).await?;
    }
    for user in seed.users {
        store.put_user(user).await?;
    }
    let tenants: HashMap<String, TenantConfig> = seed
        .tenants
        .into_iter()
        .map(|t| (t.company_id.clone(), t))
        .collect();

    let batches = Arc::new(BatchManager::new(store.clone(), store.clone()));
    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    let ingestor = Arc::new(CompletionIngestor::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        batches.clone(),
        canvass_qc::rules::default_rules(),
    ));
    let reviews = Arc::new(ReviewQueue::new(
        store.clone(),
        store.clone(),
        store.clone(),
        ReviewConfig::default(),
    ));
    let dedup = Arc::new(DuplicateDetector::new(store.clone(), DedupConfig::default()));
    let sets = Arc::new(SetRotation::new(store.clone(), store.clone()));
    let telephony = Arc::new(ProviderDirectory::new(seed.providers)?);
    let audio = Arc::new(LocalAudioStore::new(args.audio_dir.clone(), args.audio_base.clone()));

    let state = AppState {
        users: store.clone() as Arc<dyn UserStore>,
        surveys: store.clone() as Arc<dyn SurveyStore>,
        responses: store.clone(),
        sessions,
        ingestor,
        reviews,
        dedup,
        sets,
        telephony,
        tenants: Arc::new(tenants),
        audio,
        call_log: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
    };

    let app = api::router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
