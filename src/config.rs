//! Generation profiles and runtime settings.
//!
//! A profile is everything the prompt assembler and scorer need for one run: criteria
//! with weights and guiding questions, ideation frameworks, the domain/problem/solution
//! pools and the prompt template. Profiles come from a [`ConfigProvider`]; the JSON
//! directory provider reads `default.json` and `profile_<id>.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scoring::{WeightTable, DEFAULT_CRITERIA};

// =============================================================================
// Profile
// =============================================================================

fn default_weight() -> f64 {
    1.0
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Guiding questions the model must answer for this criterion.
    #[serde(default)]
    pub questions: Vec<String>,
}

impl CriterionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 1.0,
            questions: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        crate::scoring::criterion_key(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Framework {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub example: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subdomain {
    pub name: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainOption {
    pub name: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub subdomains: Vec<Subdomain>,
}

impl DomainOption {
    pub fn new(name: impl Into<String>, subdomains: &[&str]) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            subdomains: subdomains
                .iter()
                .map(|s| Subdomain {
                    name: s.to_string(),
                    enabled: true,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub criteria: Vec<CriterionConfig>,
    #[serde(default)]
    pub frameworks: Vec<Framework>,
    #[serde(default)]
    pub domains: Vec<DomainOption>,
    #[serde(default)]
    pub problems: Vec<String>,
    #[serde(default)]
    pub solutions: Vec<String>,
    #[serde(default)]
    pub monetization_models: Vec<String>,
    #[serde(default)]
    pub target_audiences: Vec<String>,
    #[serde(default)]
    pub extra_filters: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerationProfile {
    /// Weight table for scoring; the default ten criteria when none are configured.
    pub fn weights(&self) -> WeightTable {
        WeightTable::from_named(self.criteria.iter().map(|c| (c.name.as_str(), c.weight)))
    }

    /// Criteria the model is asked to evaluate.
    pub fn effective_criteria(&self) -> Vec<CriterionConfig> {
        if self.criteria.is_empty() {
            DEFAULT_CRITERIA.iter().map(|n| CriterionConfig::new(*n)).collect()
        } else {
            self.criteria.clone()
        }
    }

    pub fn expected_criteria_count(&self) -> usize {
        if self.criteria.is_empty() {
            DEFAULT_CRITERIA.len()
        } else {
            self.criteria.len()
        }
    }

    pub fn enabled_frameworks(&self) -> impl Iterator<Item = &Framework> {
        self.frameworks.iter().filter(|f| f.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prompt_template.trim().is_empty() {
            return Err(ConfigError::Invalid("prompt template is empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.criteria {
            let key = c.key();
            if key.is_empty() {
                return Err(ConfigError::Invalid(format!("criterion {:?} has no usable name", c.name)));
            }
            if !seen.insert(key.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate criterion key {key}")));
            }
        }
        Ok(())
    }

    /// Built-in profile used when no configuration directory is present.
    pub fn builtin() -> Self {
        let framework = |name: &str, description: &str, template: &str, example: &str| Framework {
            name: name.into(),
            description: description.into(),
            template: template.into(),
            example: example.into(),
            enabled: true,
        };
        Self {
            name: "builtin".into(),
            criteria: DEFAULT_CRITERIA
                .iter()
                .map(|n| CriterionConfig {
                    name: n.to_string(),
                    weight: 1.0,
                    questions: vec![format!("What evidence supports the {} score?", n.to_lowercase())],
                })
                .collect(),
            frameworks: vec![
                framework(
                    "Unbundling",
                    "Take one feature of a large platform and build a focused product around it.",
                    "[Platform] does [feature] poorly; build the best standalone [feature] for [audience].",
                    "Splitting invoicing out of an all-in-one ERP for freelancers.",
                ),
                framework(
                    "Workflow Automation",
                    "Find a repetitive manual process and automate it end to end.",
                    "[Audience] spends [time] on [task]; automate it with [approach].",
                    "Auto-reconciling bank feeds for small accounting firms.",
                ),
                framework(
                    "Regulatory Shift",
                    "Exploit a new rule or compliance deadline that forces change.",
                    "New [regulation] requires [change]; help [audience] comply via [product].",
                    "EU accessibility act audits for e-commerce storefronts.",
                ),
                framework(
                    "Marketplace",
                    "Connect fragmented supply with underserved demand.",
                    "[Supply side] cannot reach [demand side]; broker the match.",
                    "Matching idle commercial kitchens with food startups.",
                ),
            ],
            domains: vec![
                DomainOption::new("Healthcare", &["Telemedicine", "Clinical Operations"]),
                DomainOption::new("Finance", &["Small Business Lending", "Personal Budgeting"]),
                DomainOption::new("Education", &["Corporate Training"]),
                DomainOption::new("Logistics", &["Last Mile", "Warehousing"]),
                DomainOption::new("Retail", &[]),
                DomainOption::new("Construction", &["Permitting"]),
            ],
            problems: vec![
                "Manual data entry".into(),
                "Fragmented communication".into(),
                "Compliance burden".into(),
                "Poor demand forecasting".into(),
                "Slow onboarding".into(),
                "Hidden operational costs".into(),
            ],
            solutions: vec![
                "AI assistant".into(),
                "Vertical SaaS".into(),
                "Marketplace".into(),
                "API platform".into(),
                "Mobile app".into(),
                "Analytics dashboard".into(),
            ],
            monetization_models: vec!["Subscription".into(), "Usage-based".into(), "Transaction fee".into()],
            target_audiences: vec!["SMBs".into(), "Mid-market operations teams".into(), "Independent professionals".into()],
            extra_filters: None,
            system_prompt: default_system_prompt(),
            prompt_template: default_prompt_template(),
            temperature: None,
            max_tokens: None,
        }
    }
}

fn default_system_prompt() -> String {
    "You are a pragmatic venture analyst. You invent specific, buildable business ideas \
     and evaluate them honestly. Respond with a single JSON object and nothing else."
        .to_string()
}

pub const DEFAULT_PROMPT_TEMPLATE: &str = r#"Generate one new business idea using the "{framework_name}" framework.

Framework: {framework_description}
Pattern: {framework_template}
Example: {framework_example}

Pick a domain from:
{domains}

Problem types to consider:
{problems}

Solution types to consider:
{solutions}

Monetization models: {monetization_models}
Target audiences: {target_audiences}
{extra_filters}

Evaluate the idea against these {criteria_count} criteria, scoring each from 1 to 10 and answering every guiding question:
{criteria}

Return JSON with exactly this shape:
{
  "name": "short product name",
  "domain": "Domain | Subdomain",
  "problem": "the problem in one or two sentences",
  "solution": "the solution in one or two sentences",
  "quickSummary": "one sentence pitch",
  "concreteExample": {
    "currentState": "how it works today",
    "yourSolution": "how it works with this product",
    "keyImprovement": "the measurable difference"
  },
  "evaluation": {evaluation_schema},
  "tags": ["tag"]
}"#;

fn default_prompt_template() -> String {
    DEFAULT_PROMPT_TEMPLATE.to_string()
}

// =============================================================================
// Providers
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("profile {0} not found")]
    ProfileNotFound(i64),
    #[error("invalid profile: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the profile for `profile_id`, or the default profile when `None`.
    async fn load_profile(&self, profile_id: Option<i64>) -> Result<GenerationProfile, ConfigError>;
}

/// Reads profiles from a directory of JSON files.
#[derive(Debug, Clone)]
pub struct JsonConfigProvider {
    dir: PathBuf,
}

impl JsonConfigProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn profile_path(&self, profile_id: Option<i64>) -> PathBuf {
        match profile_id {
            Some(id) => self.dir.join(format!("profile_{id}.json")),
            None => self.dir.join("default.json"),
        }
    }

    async fn read(path: &Path) -> Result<Option<GenerationProfile>, ConfigError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let profile: GenerationProfile =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        profile.validate()?;
        Ok(Some(profile))
    }
}

#[async_trait]
impl ConfigProvider for JsonConfigProvider {
    async fn load_profile(&self, profile_id: Option<i64>) -> Result<GenerationProfile, ConfigError> {
        let path = self.profile_path(profile_id);
        match (Self::read(&path).await?, profile_id) {
            (Some(profile), _) => Ok(profile),
            (None, Some(id)) => Err(ConfigError::ProfileNotFound(id)),
            (None, None) => {
                tracing::warn!(path = %path.display(), "no default profile on disk, using built-in profile");
                Ok(GenerationProfile::builtin())
            }
        }
    }
}

/// Profiles held in memory.
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    default: GenerationProfile,
    profiles: HashMap<i64, GenerationProfile>,
}

impl StaticConfigProvider {
    pub fn new(default: GenerationProfile) -> Self {
        Self {
            default,
            profiles: HashMap::new(),
        }
    }

    pub fn with_profile(mut self, id: i64, profile: GenerationProfile) -> Self {
        self.profiles.insert(id, profile);
        self
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn load_profile(&self, profile_id: Option<i64>) -> Result<GenerationProfile, ConfigError> {
        match profile_id {
            None => Ok(self.default.clone()),
            Some(id) => self
                .profiles
                .get(&id)
                .cloned()
                .ok_or(ConfigError::ProfileNotFound(id)),
        }
    }
}

// =============================================================================
// Runtime settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub config_dir: PathBuf,
    pub poll_interval: Duration,
    pub countdown_interval: Duration,
    pub duplicate_threshold: f64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".ideation.sqlite"),
            config_dir: PathBuf::from("config"),
            poll_interval: Duration::from_secs(30),
            countdown_interval: Duration::from_secs(60),
            duplicate_threshold: 0.85,
            temperature: 0.8,
            max_tokens: 4096,
        }
    }
}

impl Settings {
    /// Read `IDEATION_*` overrides on top of the defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(path) = std::env::var("IDEATION_DB_PATH") {
            settings.db_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("IDEATION_CONFIG_DIR") {
            settings.config_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<u64>("IDEATION_POLL_SECONDS").filter(|s| *s > 0) {
            settings.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("IDEATION_COUNTDOWN_SECONDS").filter(|s| *s > 0) {
            settings.countdown_interval = Duration::from_secs(secs);
        }
        if let Some(t) = env_parse::<f64>("IDEATION_DUPLICATE_THRESHOLD").filter(|t| (0.0..=1.0).contains(t)) {
            settings.duplicate_threshold = t;
        }
        if let Some(t) = env_parse::<f32>("IDEATION_TEMPERATURE") {
            settings.temperature = t;
        }
        if let Some(n) = env_parse::<u32>("IDEATION_MAX_TOKENS") {
            settings.max_tokens = n;
        }
        settings
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}
