use std::time::Duration;

use chaosfeed_github::{
    GitHubConfig, RepoSlug, DEFAULT_API_URL, DEFAULT_GRAPHQL_URL, DEFAULT_OPEN_ITEM_TTL,
};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

pub const DEFAULT_REPO: &str = "skridlevsky/openchaos";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REACTIONS_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_DISCUSSIONS_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("GITHUB_REPO must be owner/repo, got {0:?}")]
    InvalidRepo(String),
    #[error("PORT must be a port number, got {0:?}")]
    InvalidPort(String),
}

#[derive(Debug)]
pub struct FeedConfig {
    pub database_url: String,
    pub github_token: SecretString,
    pub repo: RepoSlug,
    pub port: u16,
    pub environment: String,
    pub poll_interval: Duration,
    pub reactions_interval: Duration,
    pub discussions_interval: Duration,
    pub discussions_enabled: bool,
    pub open_item_ttl: Duration,
    pub api_url: String,
    pub graphql_url: String,
}

impl FeedConfig {
    /// Reads `.env` when present, then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = value("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let github_token = value("GITHUB_TOKEN")
            .map(SecretString::from)
            .ok_or(ConfigError::Missing("GITHUB_TOKEN"))?;

        let repo_raw = value("GITHUB_REPO").unwrap_or_else(|| DEFAULT_REPO.to_string());
        let repo = repo_raw
            .parse::<RepoSlug>()
            .map_err(|_| ConfigError::InvalidRepo(repo_raw.clone()))?;

        let port = match value("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw))?,
            None => DEFAULT_PORT,
        };

        let duration = |key: &str, default: Duration| {
            value(key).and_then(|raw| parse_duration(&raw)).unwrap_or(default)
        };

        Ok(Self {
            database_url,
            github_token,
            repo,
            port,
            environment: value("ENV").unwrap_or_else(|| "development".to_string()),
            poll_interval: duration("GITHUB_POLL_INTERVAL", DEFAULT_POLL_INTERVAL),
            reactions_interval: duration("GITHUB_REACTIONS_INTERVAL", DEFAULT_REACTIONS_INTERVAL),
            discussions_interval: duration(
                "GITHUB_DISCUSSIONS_INTERVAL",
                DEFAULT_DISCUSSIONS_INTERVAL,
            ),
            discussions_enabled: value("GITHUB_DISCUSSIONS_ENABLED")
                .and_then(|raw| parse_flag(&raw))
                .unwrap_or(true),
            open_item_ttl: duration("OPEN_ITEM_TTL", DEFAULT_OPEN_ITEM_TTL),
            api_url: value("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            graphql_url: value("GITHUB_GRAPHQL_URL")
                .unwrap_or_else(|| DEFAULT_GRAPHQL_URL.to_string()),
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn github_config(&self) -> GitHubConfig {
        let mut config = GitHubConfig::new(SecretString::from(
            self.github_token.expose_secret().to_string(),
        ));
        config.api_url = self.api_url.clone();
        config.graphql_url = self.graphql_url.clone();
        config
    }
}

/// Accepts `500ms`, `90s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit.trim() {
        "" | "s" => Duration::from_secs(amount),
        "ms" => Duration::from_millis(amount),
        "m" => Duration::from_secs(amount.checked_mul(60)?),
        "h" => Duration::from_secs(amount.checked_mul(3600)?),
        _ => return None,
    };
    (!duration.is_zero()).then_some(duration)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://feed@localhost/feed"),
        ("GITHUB_TOKEN", "ghp_test"),
    ];

    #[test]
    fn durations_accept_suffixes_and_bare_seconds() {
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("0s"), None);
    }

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let config = FeedConfig::from_lookup(lookup(&REQUIRED)).expect("config");
        assert_eq!(config.repo.to_string(), DEFAULT_REPO);
        assert_eq!(config.port, 8080);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.reactions_interval, Duration::from_secs(300));
        assert_eq!(config.discussions_interval, Duration::from_secs(600));
        assert!(config.discussions_enabled);
        assert!(config.is_development());
        assert_eq!(config.github_token.expose_secret(), "ghp_test");
    }

    #[test]
    fn missing_required_values_are_fatal() {
        let err = FeedConfig::from_lookup(lookup(&[("GITHUB_TOKEN", "t")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));

        let err = FeedConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GITHUB_TOKEN")));
    }

    #[test]
    fn malformed_repo_is_fatal() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("GITHUB_REPO", "just-a-name"));
        let err = FeedConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRepo(_)));
    }

    #[test]
    fn unparseable_intervals_fall_back_and_overrides_apply() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("GITHUB_POLL_INTERVAL", "whenever"),
            ("GITHUB_REACTIONS_INTERVAL", "2m"),
            ("GITHUB_DISCUSSIONS_ENABLED", "false"),
            ("GITHUB_API_URL", "http://127.0.0.1:9999"),
            ("PORT", "3001"),
        ]);
        let config = FeedConfig::from_lookup(lookup(&pairs)).expect("config");
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.reactions_interval, Duration::from_secs(120));
        assert!(!config.discussions_enabled);
        assert_eq!(config.port, 3001);
        assert_eq!(config.github_config().api_url, "http://127.0.0.1:9999");
    }
}
