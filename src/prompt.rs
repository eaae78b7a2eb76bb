//! Prompt assembly for idea generation.
//!
//! Fills a profile's template with a framework and random samples of the domain,
//! problem and solution pools. Placeholders are substituted in a single pass, so
//! text inserted for one placeholder is never re-expanded.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::{Captures, Regex};

use crate::config::{Framework, GenerationProfile};
use crate::gateway::Message;

/// Entries sampled from each of the domain, problem and solution pools.
pub const SAMPLE_SIZE: usize = 5;

/// Separator between domain and subdomain in pool entries and responses.
pub const DOMAIN_SEPARATOR: char = '|';

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("Invalid placeholder regex"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("no enabled framework configured")]
    NoEnabledFramework,
    #[error("framework {0:?} is not configured")]
    UnknownFramework(String),
    #[error("prompt template is empty")]
    EmptyTemplate,
}

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub system: String,
    pub user: String,
    pub framework: String,
    pub domains: Vec<String>,
}

impl AssembledPrompt {
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if !self.system.trim().is_empty() {
            messages.push(Message::system(&self.system));
        }
        messages.push(Message::user(&self.user));
        messages
    }

    /// Characters sent to the model.
    pub fn len(&self) -> usize {
        self.system.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build a generation prompt from `profile`.
///
/// `framework` selects by name (case-insensitive); `None` picks uniformly among the
/// enabled frameworks. `domain_hint` narrows domain sampling to matching entries and is
/// always surfaced in `{extra_filters}`.
pub fn assemble<R: Rng + ?Sized>(
    profile: &GenerationProfile,
    framework: Option<&str>,
    domain_hint: Option<&str>,
    rng: &mut R,
) -> Result<AssembledPrompt, PromptError> {
    if profile.prompt_template.trim().is_empty() {
        return Err(PromptError::EmptyTemplate);
    }

    let framework = select_framework(profile, framework, rng)?;

    let pool = domain_pool(profile);
    let hint = domain_hint.map(str::trim).filter(|h| !h.is_empty());
    let narrowed: Vec<String> = match hint {
        Some(h) => {
            let h = h.to_lowercase();
            pool.iter()
                .filter(|entry| entry.to_lowercase().contains(&h))
                .cloned()
                .collect()
        }
        None => Vec::new(),
    };
    let domain_source = if narrowed.is_empty() { &pool } else { &narrowed };

    let domains = sample(domain_source, rng);
    let problems = sample(&profile.problems, rng);
    let solutions = sample(&profile.solutions, rng);

    let criteria = profile.effective_criteria();
    let criteria_text = criteria
        .iter()
        .map(|c| {
            let mut line = format!("- {} (key: {}, weight {})", c.name, c.key(), c.weight);
            for q in &c.questions {
                line.push_str(&format!("\n    - {q}"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n");
    let evaluation_schema = evaluation_schema(criteria.iter().map(|c| c.key()));

    let mut extra = Vec::new();
    if let Some(filters) = profile.extra_filters.as_deref().filter(|f| !f.trim().is_empty()) {
        extra.push(filters.trim().to_string());
    }
    if let Some(h) = hint {
        extra.push(format!("Focus on the {h} domain."));
    }

    let values: HashMap<&str, String> = HashMap::from([
        ("framework_name", framework.name.clone()),
        ("framework_description", framework.description.clone()),
        ("framework_template", framework.template.clone()),
        ("framework_example", framework.example.clone()),
        ("domains", bullet_list(&domains)),
        ("problems", bullet_list(&problems)),
        ("solutions", bullet_list(&solutions)),
        ("criteria", criteria_text),
        ("evaluation_schema", evaluation_schema),
        ("criteria_count", criteria.len().to_string()),
        ("extra_filters", extra.join("\n")),
        ("monetization_models", profile.monetization_models.join(", ")),
        ("target_audiences", profile.target_audiences.join(", ")),
    ]);

    Ok(AssembledPrompt {
        system: profile.system_prompt.trim().to_string(),
        user: render(&profile.prompt_template, &values).trim().to_string(),
        framework: framework.name.clone(),
        domains,
    })
}

/// Substitute `{name}` placeholders; unknown placeholders are left as written.
pub fn render(template: &str, values: &HashMap<&str, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match values.get(&caps[1]) {
            Some(v) => v.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn select_framework<'a, R: Rng + ?Sized>(
    profile: &'a GenerationProfile,
    name: Option<&str>,
    rng: &mut R,
) -> Result<&'a Framework, PromptError> {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => profile
            .frameworks
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| PromptError::UnknownFramework(name.to_string())),
        None => {
            let enabled: Vec<&Framework> = profile.enabled_frameworks().collect();
            enabled
                .choose(rng)
                .copied()
                .ok_or(PromptError::NoEnabledFramework)
        }
    }
}

/// One entry per enabled subdomain ("Domain | Subdomain"), or the bare domain when it
/// has no enabled subdomains.
pub fn domain_pool(profile: &GenerationProfile) -> Vec<String> {
    let mut pool = Vec::new();
    for domain in profile.domains.iter().filter(|d| d.enabled) {
        let before = pool.len();
        for sub in domain.subdomains.iter().filter(|s| s.enabled) {
            pool.push(format!("{} {DOMAIN_SEPARATOR} {}", domain.name, sub.name));
        }
        if pool.len() == before {
            pool.push(domain.name.clone());
        }
    }
    pool
}

fn sample<R: Rng + ?Sized>(pool: &[String], rng: &mut R) -> Vec<String> {
    pool.choose_multiple(rng, SAMPLE_SIZE.min(pool.len()))
        .cloned()
        .collect()
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn evaluation_schema(keys: impl Iterator<Item = String>) -> String {
    let entries: Vec<String> = keys
        .map(|k| {
            format!(
                "    \"{k}\": {{\"score\": 1-10, \"reasoning\": \"...\", \"questions\": [{{\"question\": \"...\", \"answer\": \"...\"}}]}}"
            )
        })
        .collect();
    format!("{{\n{}\n  }}", entries.join(",\n"))
}
