#![forbid(unsafe_code)]

//! # ideation-harness
//!
//! Generates business ideas with an LLM and validates them before they are kept.
//!
//! One run assembles a prompt from a configurable profile (frameworks, domain pools,
//! weighted criteria), calls the model once, repairs and validates the JSON it returns,
//! scores the idea against the criteria weights, estimates its complexity, rejects
//! semantic duplicates by embedding similarity, and persists the result. Each run is a
//! session with a stage-by-stage log. A slot scheduler triggers runs on fixed intervals.

pub mod complexity;
pub mod config;
pub mod credentials;
pub mod dedup;
pub mod gateway;
pub mod idea;
pub mod orchestrator;
pub mod prompt;
pub mod repair;
pub mod scheduler;
pub mod scoring;
pub mod session;
pub mod store;

pub use config::{ConfigProvider, GenerationProfile, JsonConfigProvider, Settings, StaticConfigProvider};
pub use credentials::{ApiCredential, ChainedCredentials, CredentialSource, EnvCredentials, ModelConnector};
pub use dedup::{DuplicateDetector, DuplicateMatch, EmbeddingDuplicateDetector};
pub use gateway::{Attribution, ChatGateway, EmbeddingProvider, ProviderGateway, UsageSink};
pub use idea::{IdeaDraft, IdeaRecord};
pub use orchestrator::{
    GenerationError, GenerationOutcome, GenerationRequest, GenerationSummary, IdeaGenerator,
    Orchestrator,
};
pub use scheduler::{SchedulerConfig, SlotOutcome, SlotRun, SlotScheduler};
pub use session::{LogEntry, SessionStatus, Severity, Stage};
pub use store::{IdeaStore, StoreError};
