//! Generation orchestrator: sequences one pipeline run through its stages.
//!
//! `INIT → CONFIG_VERIFY → PROMPT_BUILD → API_CALL → RESPONSE_PARSE → DUPLICATE_CHECK →
//! DB_SAVE → COMPLETE`, with `FAILED` reachable from any stage. Every transition is
//! written to the session log; the session's terminal status is set exactly once.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{ConfigError, ConfigProvider, Settings};
use crate::credentials::{
    CredentialError, CredentialSource, ModelConnector, CHAT_PROVIDER, DEFAULT_CHAT_MODEL,
};
use crate::dedup::{DuplicateDetector, DuplicateMatch, DuplicateReport};
use crate::gateway::{Attribution, ChatModel, ChatRequest, ProviderError};
use crate::idea::IdeaRecord;
use crate::prompt::{self, PromptError};
use crate::repair::{self, ParseError};
use crate::session::{LogEntry, SessionLogger, SessionStatus, Stage};
use crate::store::{now_epoch, IdeaStore, StoreError};

// =============================================================================
// Request / outcome
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub framework: Option<String>,
    pub domain_hint: Option<String>,
    pub skip_duplicate_check: bool,
    pub session_id: String,
    pub slot_id: Option<i64>,
    pub profile_id: Option<i64>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationRequest {
    /// Request with a fresh session id and no constraints.
    pub fn new() -> Self {
        Self {
            framework: None,
            domain_hint: None,
            skip_duplicate_check: false,
            session_id: uuid::Uuid::new_v4().to_string(),
            slot_id: None,
            profile_id: None,
        }
    }

    /// Request issued by the scheduler for `slot_id`.
    pub fn for_slot(slot_id: i64, profile_id: Option<i64>) -> Self {
        Self {
            slot_id: Some(slot_id),
            profile_id,
            ..Self::new()
        }
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }

    pub fn with_domain_hint(mut self, hint: impl Into<String>) -> Self {
        self.domain_hint = Some(hint.into());
        self
    }

    pub fn with_profile(mut self, profile_id: i64) -> Self {
        self.profile_id = Some(profile_id);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn skip_duplicate_check(mut self, skip: bool) -> Self {
        self.skip_duplicate_check = skip;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSummary {
    pub session_id: String,
    pub idea_id: i64,
    pub name: String,
    pub score: u8,
    pub framework: String,
    /// Closest stored idea above the threshold, when the duplicate check was skipped.
    pub similar: Option<DuplicateMatch>,
    pub prompt_chars: usize,
    pub api_ms: u64,
    pub duration_ms: u64,
    pub cost_nanodollars: i64,
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub idea: IdeaRecord,
    pub logs: Vec<LogEntry>,
    pub summary: GenerationSummary,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{provider} call failed: {message}")]
    ExternalService { provider: String, message: String },
    #[error("invalid model response: {0}")]
    Validation(#[from] ParseError),
    #[error("duplicate of idea {idea_id} ({name}) at similarity {similarity:.3}")]
    Conflict {
        idea_id: i64,
        name: String,
        similarity: f64,
    },
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl GenerationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::ExternalService { .. } => "external_service_error",
            Self::Validation(_) => "validation_error",
            Self::Conflict { .. } => "conflict",
            Self::Store(_) => "storage_error",
        }
    }

    fn details(&self) -> Value {
        match self {
            Self::Validation(ParseError::Parse { preview, .. }) => {
                json!({"code": self.code(), "kind": "parse_failed", "preview": preview})
            }
            Self::Validation(ParseError::MissingFields(fields)) => {
                json!({"code": self.code(), "kind": "missing_fields", "missing": fields})
            }
            Self::Validation(ParseError::MalformedExample(fields)) => {
                json!({"code": self.code(), "kind": "malformed_example", "missing": fields})
            }
            Self::Validation(ParseError::IncompleteCriteria(criteria)) => {
                json!({"code": self.code(), "kind": "incomplete_criteria", "criteria": criteria})
            }
            Self::Validation(ParseError::CriteriaCountMismatch { expected, actual }) => json!({
                "code": self.code(),
                "kind": "criteria_count_mismatch",
                "expected": expected,
                "actual": actual,
            }),
            Self::Conflict {
                idea_id,
                similarity,
                ..
            } => json!({"code": self.code(), "ideaId": idea_id, "similarity": similarity}),
            Self::ExternalService { provider, .. } => {
                json!({"code": self.code(), "provider": provider})
            }
            _ => json!({"code": self.code()}),
        }
    }
}

impl From<ConfigError> for GenerationError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<PromptError> for GenerationError {
    fn from(e: PromptError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<CredentialError> for GenerationError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::Store(e) => Self::Store(e),
        }
    }
}

impl From<ProviderError> for GenerationError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Config(message) => Self::Config(message),
            other => Self::ExternalService {
                provider: other.provider_name().unwrap_or(CHAT_PROVIDER).to_string(),
                message: other.to_string(),
            },
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs one generation pipeline. The scheduler depends on this seam.
#[async_trait]
pub trait IdeaGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, GenerationError>;
}

pub struct Orchestrator {
    store: IdeaStore,
    credentials: Arc<dyn CredentialSource>,
    connector: Arc<dyn ModelConnector>,
    config: Arc<dyn ConfigProvider>,
    detector: Arc<dyn DuplicateDetector>,
    temperature: f32,
    max_tokens: u32,
    rng: Mutex<StdRng>,
}

impl Orchestrator {
    pub fn new(
        store: IdeaStore,
        credentials: Arc<dyn CredentialSource>,
        connector: Arc<dyn ModelConnector>,
        config: Arc<dyn ConfigProvider>,
        detector: Arc<dyn DuplicateDetector>,
    ) -> Self {
        let defaults = Settings::default();
        Self {
            store,
            credentials,
            connector,
            config,
            detector,
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Sampling defaults used when the profile does not set its own.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.temperature = settings.temperature;
        self.max_tokens = settings.max_tokens;
        self
    }

    /// Deterministic framework and pool sampling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Run the pipeline for `request` and return the saved idea with its session log.
    pub async fn generate_idea(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        let started = Instant::now();
        let mut log =
            SessionLogger::start(self.store.clone(), &request.session_id, request.slot_id).await;
        let mut stage = Stage::Init;

        log.info(
            Stage::Init,
            "Generation started",
            json!({
                "slotId": request.slot_id,
                "profileId": request.profile_id,
                "framework": request.framework,
                "domainHint": request.domain_hint,
                "skipDuplicateCheck": request.skip_duplicate_check,
            }),
        )
        .await;
        log.set_status(SessionStatus::InProgress, None).await;

        match self.run_stages(&request, &mut log, &mut stage, started).await {
            Ok((idea, summary)) => {
                log.set_status(SessionStatus::Completed, Some(idea.id)).await;
                Ok(GenerationOutcome {
                    idea,
                    logs: log.into_entries(),
                    summary,
                })
            }
            Err(err) => {
                log.error(stage, err.to_string(), err.details()).await;
                log.error(
                    Stage::Failed,
                    format!("Generation failed at {}", stage.as_str()),
                    json!({
                        "stage": stage.as_str(),
                        "error": err.to_string(),
                        "durationMs": elapsed_ms(started),
                    }),
                )
                .await;
                log.set_status(SessionStatus::Failed, None).await;
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        request: &GenerationRequest,
        log: &mut SessionLogger,
        stage: &mut Stage,
        started: Instant,
    ) -> Result<(IdeaRecord, GenerationSummary), GenerationError> {
        // CONFIG_VERIFY
        *stage = Stage::ConfigVerify;
        let credential = self
            .credentials
            .active_credential(CHAT_PROVIDER)
            .await?
            .ok_or_else(|| {
                GenerationError::Config(format!("no active {CHAT_PROVIDER} credential configured"))
            })?;
        let profile = self.config.load_profile(request.profile_id).await?;
        profile.validate()?;
        let gateway = self.connector.connect(&credential)?;
        let model_id = credential
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string());
        let expected_criteria = profile.expected_criteria_count();
        log.success(
            Stage::ConfigVerify,
            "Configuration verified",
            json!({
                "provider": CHAT_PROVIDER,
                "key": credential.masked_key(),
                "model": model_id,
                "profile": profile.name,
                "criteria": expected_criteria,
            }),
        )
        .await;

        // PROMPT_BUILD
        *stage = Stage::PromptBuild;
        let assembled = {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            prompt::assemble(
                &profile,
                request.framework.as_deref(),
                request.domain_hint.as_deref(),
                &mut *rng,
            )?
        };
        let prompt_chars = assembled.len();
        log.info(
            Stage::PromptBuild,
            format!("Prompt built with framework {}", assembled.framework),
            json!({
                "framework": assembled.framework,
                "promptChars": prompt_chars,
                "domains": assembled.domains,
            }),
        )
        .await;

        // API_CALL
        *stage = Stage::ApiCall;
        let attribution = Attribution::new("orchestrator::generate_idea")
            .with_session(&request.session_id)
            .with_slot(request.slot_id);
        let chat = ChatRequest::new(
            ChatModel::openrouter(&model_id),
            assembled.to_messages(),
            attribution.clone(),
        )
        .temperature(profile.temperature.unwrap_or(self.temperature))
        .max_tokens(profile.max_tokens.unwrap_or(self.max_tokens))
        .json();
        let api_started = Instant::now();
        let response = gateway.chat(chat).await?;
        let api_ms = elapsed_ms(api_started);
        log.success(
            Stage::ApiCall,
            format!("Model responded in {api_ms} ms"),
            json!({
                "model": model_id,
                "durationMs": api_ms,
                "inputTokens": response.input_tokens,
                "outputTokens": response.output_tokens,
                "responseChars": response.content.len(),
                "costNanodollars": response.cost_nanodollars,
            }),
        )
        .await;
        if response.truncated() {
            log.warning(
                Stage::ApiCall,
                "Response hit the token limit and may be incomplete",
                json!({"maxTokens": profile.max_tokens.unwrap_or(self.max_tokens)}),
            )
            .await;
        }

        // RESPONSE_PARSE
        *stage = Stage::ResponseParse;
        let draft = repair::parse_idea(&response.content, Some(expected_criteria))?;
        log.success(
            Stage::ResponseParse,
            format!("Parsed idea {:?}", draft.name),
            json!({
                "name": draft.name,
                "domain": draft.domain,
                "subdomain": draft.subdomain,
                "criteria": draft.evaluation.len(),
            }),
        )
        .await;

        // DUPLICATE_CHECK
        *stage = Stage::DuplicateCheck;
        let report = match self.detector.check(&draft, None, attribution).await {
            Ok(report) => Some(report),
            Err(e) => {
                log.warning(
                    Stage::DuplicateCheck,
                    "Duplicate check unavailable, continuing without it",
                    json!({"error": e.to_string()}),
                )
                .await;
                None
            }
        };
        let similar = report.as_ref().and_then(DuplicateReport::best).cloned();
        match &similar {
            Some(m) if !request.skip_duplicate_check => {
                return Err(GenerationError::Conflict {
                    idea_id: m.idea_id,
                    name: m.name.clone(),
                    similarity: m.similarity,
                });
            }
            Some(m) => {
                log.warning(
                    Stage::DuplicateCheck,
                    format!("Similar to idea {} ({}); saving anyway", m.idea_id, m.name),
                    json!({"ideaId": m.idea_id, "similarity": m.similarity}),
                )
                .await;
            }
            None if report.is_some() => {
                log.success(Stage::DuplicateCheck, "No duplicate found", Value::Null)
                    .await;
            }
            None => {}
        }

        // DB_SAVE
        *stage = Stage::DbSave;
        let mut idea = IdeaRecord::from_draft(
            draft,
            &profile.weights(),
            &assembled.framework,
            &response.content,
            &assembled.user,
        );
        idea.session_id = Some(request.session_id.clone());
        idea.created_at = now_epoch();
        idea.id = self.store.insert_idea(&idea).await?;
        // The idea row is committed; history and embedding are best effort from here.
        if let Err(e) = self
            .store
            .insert_history(
                idea.id,
                "created",
                "Generated by pipeline",
                None,
                Some(idea.snapshot()),
            )
            .await
        {
            log.warning(
                Stage::DbSave,
                "Failed to record idea history",
                json!({"ideaId": idea.id, "error": e.to_string()}),
            )
            .await;
        }
        if let Some(report) = &report {
            if let Err(e) = self
                .store
                .put_embedding(idea.id, &report.model, &report.embedding)
                .await
            {
                log.warning(
                    Stage::DbSave,
                    "Failed to store embedding",
                    json!({"ideaId": idea.id, "error": e.to_string()}),
                )
                .await;
            }
        }
        log.success(
            Stage::DbSave,
            format!("Saved idea {} with score {}", idea.id, idea.score),
            json!({
                "ideaId": idea.id,
                "score": idea.score,
                "complexity": idea.complexity,
            }),
        )
        .await;

        // COMPLETE
        *stage = Stage::Complete;
        let duration_ms = elapsed_ms(started);
        log.success(
            Stage::Complete,
            format!("Generation complete in {duration_ms} ms"),
            json!({"ideaId": idea.id, "durationMs": duration_ms}),
        )
        .await;

        let summary = GenerationSummary {
            session_id: request.session_id.clone(),
            idea_id: idea.id,
            name: idea.name.clone(),
            score: idea.score,
            framework: idea.framework.clone(),
            similar,
            prompt_chars,
            api_ms,
            duration_ms,
            cost_nanodollars: response.cost_nanodollars,
        };
        Ok((idea, summary))
    }
}

#[async_trait]
impl IdeaGenerator for Orchestrator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, GenerationError> {
        self.generate_idea(request).await
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_map_to_taxonomy() {
        let err: GenerationError = ProviderError::config("OPENROUTER_API_KEY not set").into();
        assert_eq!(err.code(), "config_error");

        let err: GenerationError = ProviderError::refused("policy").into();
        match err {
            GenerationError::ExternalService { provider, .. } => assert_eq!(provider, CHAT_PROVIDER),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prompt_errors_are_configuration_errors() {
        let err: GenerationError = PromptError::NoEnabledFramework.into();
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn parse_failure_details_carry_preview() {
        let err: GenerationError = ParseError::Parse {
            message: "eof".into(),
            preview: "not json".into(),
        }
        .into();
        let details = err.details();
        assert_eq!(details["kind"], "parse_failed");
        assert_eq!(details["preview"], "not json");
    }

    #[test]
    fn validation_details_name_the_offending_fields() {
        let err: GenerationError = ParseError::IncompleteCriteria(vec!["marketSize".into()]).into();
        assert_eq!(err.details()["criteria"], json!(["marketSize"]));

        let err: GenerationError = ParseError::MissingFields(vec!["name", "evaluation"]).into();
        assert_eq!(err.details()["missing"], json!(["name", "evaluation"]));

        let err: GenerationError = ParseError::MalformedExample(vec!["keyImprovement"]).into();
        assert_eq!(err.details()["kind"], "malformed_example");
        assert_eq!(err.details()["missing"], json!(["keyImprovement"]));
    }

    #[test]
    fn slot_requests_get_distinct_sessions() {
        let a = GenerationRequest::for_slot(3, Some(1));
        let b = GenerationRequest::for_slot(3, Some(1));
        assert_eq!(a.slot_id, Some(3));
        assert_ne!(a.session_id, b.session_id);
    }
}
