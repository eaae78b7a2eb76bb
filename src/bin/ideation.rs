#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ideation_harness::config::{JsonConfigProvider, Settings};
use ideation_harness::credentials::{
    ApiCredential, ChainedCredentials, CredentialSource, EnvCredentials, OpenRouterConnector,
};
use ideation_harness::dedup::EmbeddingDuplicateDetector;
use ideation_harness::gateway::openrouter::timeout_from_env;
use ideation_harness::gateway::{NoopUsageSink, OpenAiEmbeddings, StderrUsageSink, UsageSink};
use ideation_harness::orchestrator::{GenerationRequest, Orchestrator};
use ideation_harness::scheduler::{SchedulerConfig, SlotScheduler};
use ideation_harness::store::{IdeaStore, NewSlot};

#[derive(Parser)]
#[command(name = "ideation", version, about = "Idea generation and validation pipeline")]
struct Cli {
    /// SQLite database (default: IDEATION_DB_PATH or .ideation.sqlite)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Directory holding default.json and profile_<id>.json
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Write provider usage records to stderr as JSON lines
    #[arg(long, global = true)]
    usage: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once
    Generate {
        #[arg(long)]
        framework: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        profile: Option<i64>,
        /// Save even when a similar idea exists
        #[arg(long)]
        skip_duplicate_check: bool,
        /// Print the full idea as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the slot scheduler until interrupted
    Schedule,
    /// Manage generation slots
    Slot {
        #[command(subcommand)]
        command: SlotCommands,
    },
    /// Inspect stored ideas
    Ideas {
        #[command(subcommand)]
        command: IdeaCommands,
    },
    /// Show a session's status and log
    Logs { session_id: String },
    /// Manage provider credentials
    Credential {
        #[command(subcommand)]
        command: CredentialCommands,
    },
}

#[derive(Subcommand)]
enum SlotCommands {
    Add {
        #[arg(long)]
        interval_minutes: i64,
        #[arg(long, default_value = "")]
        label: String,
        #[arg(long)]
        profile: Option<i64>,
        #[arg(long)]
        disabled: bool,
    },
    List,
    Enable { id: i64 },
    Disable { id: i64 },
    /// Assign a profile to a slot; omit --profile to use the default
    Profile {
        id: i64,
        #[arg(long)]
        profile: Option<i64>,
    },
}

#[derive(Subcommand)]
enum IdeaCommands {
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    Show { id: i64 },
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum CredentialCommands {
    /// Store and activate a credential, replacing the provider's active one
    Set {
        #[arg(long)]
        provider: String,
        #[arg(long, env = "IDEATION_API_KEY", hide_env_values = true)]
        api_key: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Deactivate a provider's stored credentials
    Clear {
        #[arg(long)]
        provider: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    if let Some(dir) = cli.config_dir {
        settings.config_dir = dir;
    }
    let store = IdeaStore::new(&settings.db_path)?;
    let usage_sink: Arc<dyn UsageSink> = if cli.usage {
        Arc::new(StderrUsageSink)
    } else {
        Arc::new(NoopUsageSink)
    };

    match cli.command {
        Commands::Generate {
            framework,
            domain,
            profile,
            skip_duplicate_check,
            json,
        } => {
            let orchestrator = build_orchestrator(&store, &settings, usage_sink)?;
            let mut request = GenerationRequest::new().skip_duplicate_check(skip_duplicate_check);
            request.framework = framework;
            request.domain_hint = domain;
            request.profile_id = profile;

            let session_id = request.session_id.clone();
            match orchestrator.generate_idea(request).await {
                Ok(outcome) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&outcome.idea)?);
                    } else {
                        let s = &outcome.summary;
                        println!("idea {}: {} (score {})", s.idea_id, s.name, s.score);
                        println!("  framework: {}", s.framework);
                        println!("  domain: {}", outcome.idea.domain_label());
                        println!("  complexity: {:.1}", outcome.idea.complexity.total);
                        if let Some(similar) = &s.similar {
                            println!(
                                "  similar to idea {} ({:.3})",
                                similar.idea_id, similar.similarity
                            );
                        }
                        println!("  session: {} ({} ms)", s.session_id, s.duration_ms);
                    }
                }
                Err(e) => {
                    eprintln!("generation failed [{}]: {e}", e.code());
                    eprintln!("see: ideation logs {session_id}");
                    return Err(e.into());
                }
            }
        }
        Commands::Schedule => {
            let orchestrator = build_orchestrator(&store, &settings, usage_sink)?;
            let scheduler = Arc::new(SlotScheduler::new(
                store.clone(),
                Arc::new(orchestrator),
                SchedulerConfig::from(&settings),
            ));
            scheduler.start();
            tokio::signal::ctrl_c().await?;
            eprintln!("stopping scheduler (waiting for any running generation)...");
            scheduler.stop().await;
        }
        Commands::Slot { command } => match command {
            SlotCommands::Add {
                interval_minutes,
                label,
                profile,
                disabled,
            } => {
                if interval_minutes < 1 {
                    return Err("--interval-minutes must be >= 1".into());
                }
                let id = store
                    .create_slot(NewSlot {
                        label,
                        profile_id: profile,
                        enabled: !disabled,
                        ..NewSlot::every(interval_minutes)
                    })
                    .await?;
                println!("slot {id} created");
            }
            SlotCommands::List => {
                for slot in store.list_slots().await? {
                    println!(
                        "{}\t{}\tevery {} min\tnext {}\tlast {}\tprofile {}\t{}",
                        slot.id,
                        if slot.enabled { "enabled" } else { "disabled" },
                        slot.interval_minutes,
                        format_epoch(slot.next_due_at),
                        format_epoch(slot.last_run_at),
                        slot.profile_id
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "default".to_string()),
                        slot.label,
                    );
                }
            }
            SlotCommands::Enable { id } => {
                store.set_slot_enabled(id, true).await?;
                println!("slot {id} enabled");
            }
            SlotCommands::Disable { id } => {
                store.set_slot_enabled(id, false).await?;
                println!("slot {id} disabled");
            }
            SlotCommands::Profile { id, profile } => {
                store.set_slot_profile(id, profile).await?;
                println!("slot {id} updated");
            }
        },
        Commands::Ideas { command } => match command {
            IdeaCommands::List { limit } => {
                for idea in store.list_ideas(limit).await? {
                    println!(
                        "{}\t{}\t{}\t{}\t{}",
                        idea.id,
                        idea.score,
                        format_epoch(Some(idea.created_at)),
                        idea.domain_label(),
                        idea.name
                    );
                }
            }
            IdeaCommands::Show { id } => {
                let idea = store.get_idea(id).await?;
                println!("{}", serde_json::to_string_pretty(&idea)?);
                let history = store.idea_history(id).await?;
                for entry in history {
                    eprintln!(
                        "history: {} {} {}",
                        format_epoch(Some(entry.created_at)),
                        entry.change_type,
                        entry.description
                    );
                }
            }
            IdeaCommands::Delete { id } => {
                store.delete_idea(id).await?;
                println!("idea {id} deleted");
            }
        },
        Commands::Logs { session_id } => {
            let session = store.get_session(&session_id).await?;
            println!(
                "session {} [{}] slot {} idea {}",
                session.session_id,
                session.status.as_str(),
                session.slot_id.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                session.idea_id.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            );
            for entry in store.session_logs(&session_id).await? {
                let details = if entry.details.is_null() {
                    String::new()
                } else {
                    format!(" {}", entry.details)
                };
                println!(
                    "{} {:<16} {:<8} {}{}",
                    format_epoch_ms(entry.timestamp_ms),
                    entry.stage.as_str(),
                    entry.severity.as_str(),
                    entry.message,
                    details
                );
            }
        }
        Commands::Credential { command } => match command {
            CredentialCommands::Set {
                provider,
                api_key,
                model,
                base_url,
            } => {
                let mut credential = ApiCredential::new(provider, api_key);
                credential.model = model;
                credential.base_url = base_url;
                store.set_credential(&credential).await?;
                println!(
                    "{} credential {} is now active",
                    credential.provider,
                    credential.masked_key()
                );
            }
            CredentialCommands::Clear { provider } => {
                let n = store.deactivate_credentials(&provider).await?;
                println!("deactivated {n} {provider} credential(s)");
            }
        },
    }

    Ok(())
}

fn build_orchestrator(
    store: &IdeaStore,
    settings: &Settings,
    usage_sink: Arc<dyn UsageSink>,
) -> Result<Orchestrator, Box<dyn std::error::Error>> {
    let credentials: Arc<dyn CredentialSource> = Arc::new(ChainedCredentials::new(vec![
        Arc::new(store.clone()) as Arc<dyn CredentialSource>,
        Arc::new(EnvCredentials),
    ]));
    let embedder = OpenAiEmbeddings::new(credentials.clone(), usage_sink.clone(), timeout_from_env())?;
    let detector = EmbeddingDuplicateDetector::new(Arc::new(embedder), store.clone())
        .with_threshold(settings.duplicate_threshold);
    Ok(Orchestrator::new(
        store.clone(),
        credentials,
        Arc::new(OpenRouterConnector::new(usage_sink)),
        Arc::new(JsonConfigProvider::new(settings.config_dir.clone())),
        Arc::new(detector),
    )
    .with_settings(settings))
}

fn format_epoch(secs: Option<i64>) -> String {
    secs.and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_epoch_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}
