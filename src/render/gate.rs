//! Decides which requests are rendered on the server.

use axum::http::{HeaderMap, header};
use regex::{Regex, RegexBuilder};

use crate::config::RendererSettings;

use super::error::GateError;

/// Crawler signatures checked before any configured additions.
pub const DEFAULT_AGENTS: &[&str] = &[
    "(?i).*Googlebot.*",
    "(?i).*AdsBot.*",
    "(?i).*Mediapartners-Google.*",
    "(?i).*developers\\.google\\.com.*",
    "(?i).*Bingbot.*",
    "(?i).*LinkedInBot.*",
    "(?i).*TwitterBot.*",
    "(?i).*Pinterestbot.*",
    "(?i).*Slurp.*",
    "(?i).*DuckDuckBot.*",
    "(?i).*Baiduspider.*",
    "(?i).*YandexBot.*",
    "(?i).*Sogou.*",
    "(?i).*Exabot.*",
    "(?i).*facebook\\.com.*",
    "(?i).*crawler@alexa\\.com.*",
    "(?i).*(bot|googlebot|crawler|spider|robot|crawling).*",
];

/// Force path installed in development mode: any URL whose query ends in
/// `$prerender`.
pub const DEVELOPMENT_FORCE_PATH: &str = ".*\\?.*\\$prerender";

/// Pattern matched against the whole value.
#[derive(Debug, Clone)]
pub struct BotRule {
    pattern: String,
    regex: Regex,
}

impl BotRule {
    pub fn new(pattern: &str) -> Result<Self, GateError> {
        Self::build(pattern, true)
    }

    fn build(pattern: &str, case_insensitive: bool) -> Result<Self, GateError> {
        let regex = RegexBuilder::new(&format!("^(?:{pattern})$"))
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|source| GateError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

/// Why a request was selected for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMatch<'a> {
    ForcePath(&'a str),
    Agent(&'a str),
}

/// Stateless predicate over the request target and `User-Agent`.
#[derive(Debug, Clone)]
pub struct BotGate {
    force_path: Option<BotRule>,
    rules: Vec<BotRule>,
}

impl BotGate {
    /// Build a gate from the built-in signatures followed by `agents`.
    pub fn new<S: AsRef<str>>(force_path: Option<&str>, agents: &[S]) -> Result<Self, GateError> {
        let force_path = force_path
            .map(|pattern| BotRule::build(pattern, false))
            .transpose()?;
        let rules = DEFAULT_AGENTS
            .iter()
            .map(|pattern| BotRule::new(pattern))
            .chain(agents.iter().map(|pattern| BotRule::new(pattern.as_ref())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { force_path, rules })
    }

    /// Development mode replaces the configured force path.
    pub fn from_settings(settings: &RendererSettings) -> Result<Self, GateError> {
        let force_path = if settings.development {
            Some(DEVELOPMENT_FORCE_PATH)
        } else {
            settings.force_path.as_deref()
        };
        Self::new(force_path, settings.agents.as_slice())
    }

    pub fn rules(&self) -> &[BotRule] {
        &self.rules
    }

    /// `target` is the request path with its query, as sent on the wire.
    pub fn should_render(&self, target: &str, headers: &HeaderMap) -> bool {
        self.matching(target, headers).is_some()
    }

    /// First reason to render, if any. Missing or undecodable `User-Agent`
    /// values never match.
    pub fn matching(&self, target: &str, headers: &HeaderMap) -> Option<GateMatch<'_>> {
        if let Some(rule) = self.force_path.as_ref().filter(|rule| rule.matches(target)) {
            return Some(GateMatch::ForcePath(rule.pattern()));
        }

        headers
            .get_all(header::USER_AGENT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|agent| self.rules.iter().find(|rule| rule.matches(agent)))
            .map(|rule| GateMatch::Agent(rule.pattern()))
    }
}
