use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{AppError, Result};
use crate::models::{ImpactScore, MAX_IMPACT_SCORE};

const DEFAULT_CLAUDE_MODEL: &str = "claude-3-5-haiku-20241022";

/// Runtime configuration, read once from the environment and handed to each
/// component at construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,

    pub discord_token: Option<String>,
    pub channel_id: Option<u64>,

    pub claude_api_key: Option<String>,
    pub claude_model: String,

    pub embed_api_url: Url,

    pub arxiv_category: String,
    pub fetch_days: u32,
    pub recent_days: u32,
    pub max_results: usize,

    pub score_threshold: ImpactScore,
    pub poll_interval_minutes: u32,
    pub feed_batch_limit: usize,
    pub similarity_floor: f32,

    pub embed_batch_size: usize,
    pub llm_pause_every: u32,
    pub llm_pause_secs: u64,
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("arxiv-bot");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("papers.db").to_string_lossy().to_string()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key/value source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let embed_api_url = get("EMBED_API_URL")
            .ok_or_else(|| AppError::Config("EMBED_API_URL is not set".to_string()))?;
        let embed_api_url = Url::parse(&embed_api_url)
            .map_err(|e| AppError::Config(format!("EMBED_API_URL: {}", e)))?;

        let channel_id = get("DISCORD_CHANNEL_ID")
            .map(|v| parse_var::<u64>("DISCORD_CHANNEL_ID", &v))
            .transpose()?;

        let threshold = parse_or("SCORE_THRESHOLD", get("SCORE_THRESHOLD"), 7i64)?;
        let score_threshold = ImpactScore::new(threshold).map_err(|_| {
            AppError::Config(format!(
                "SCORE_THRESHOLD must be between 1 and {}, got {}",
                MAX_IMPACT_SCORE, threshold
            ))
        })?;

        let poll_interval_minutes = parse_or("POLL_INTERVAL_MINUTES", get("POLL_INTERVAL_MINUTES"), 60u32)?;
        if poll_interval_minutes == 0 {
            return Err(AppError::Config(
                "POLL_INTERVAL_MINUTES must be at least 1".to_string(),
            ));
        }

        let similarity_floor = parse_or("SIMILARITY_FLOOR", get("SIMILARITY_FLOOR"), 0.3f32)?;
        if !(-1.0..=1.0).contains(&similarity_floor) {
            return Err(AppError::Config(format!(
                "SIMILARITY_FLOOR must be within -1..=1, got {}",
                similarity_floor
            )));
        }

        Ok(Self {
            db_path: get("ARXIV_DB_PATH").unwrap_or_else(default_db_path),
            discord_token: get("DISCORD_BOT_TOKEN"),
            channel_id,
            claude_api_key: get("CLAUDE_API_KEY"),
            claude_model: get("CLAUDE_MODEL").unwrap_or_else(|| DEFAULT_CLAUDE_MODEL.to_string()),
            embed_api_url,
            arxiv_category: get("ARXIV_CATEGORY").unwrap_or_else(|| "cs.*".to_string()),
            fetch_days: parse_or("FETCH_DAYS", get("FETCH_DAYS"), 3)?,
            recent_days: parse_or("RECENT_DAYS", get("RECENT_DAYS"), 2)?,
            max_results: parse_or("MAX_RESULTS", get("MAX_RESULTS"), 300)?,
            score_threshold,
            poll_interval_minutes,
            feed_batch_limit: parse_or("FEED_BATCH_LIMIT", get("FEED_BATCH_LIMIT"), 10)?,
            similarity_floor,
            embed_batch_size: parse_or("EMBED_BATCH_SIZE", get("EMBED_BATCH_SIZE"), 16usize)?.max(1),
            llm_pause_every: parse_or("LLM_PAUSE_EVERY", get("LLM_PAUSE_EVERY"), 10)?,
            llm_pause_secs: parse_or("LLM_PAUSE_SECS", get("LLM_PAUSE_SECS"), 5)?,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.poll_interval_minutes) * 60)
    }

    /// Credentials the long-running bot cannot start without.
    pub fn require_bot(&self) -> Result<(&str, u64)> {
        let token = self
            .discord_token
            .as_deref()
            .ok_or_else(|| AppError::Config("DISCORD_BOT_TOKEN is not set".to_string()))?;
        let channel = self
            .channel_id
            .ok_or_else(|| AppError::Config("DISCORD_CHANNEL_ID is not set".to_string()))?;
        Ok((token, channel))
    }

    pub fn require_scoring(&self) -> Result<&str> {
        self.claude_api_key
            .as_deref()
            .ok_or_else(|| AppError::Config("CLAUDE_API_KEY is not set".to_string()))
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| AppError::Config(format!("{} has an invalid value: {:?}", key, value)))
}

fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        Some(v) => parse_var(key, &v),
        None => Ok(default),
    }
}

/// Masks a credential for display, keeping a short prefix.
pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() > 8 {
        format!("{}...", secret.chars().take(8).collect::<String>())
    } else {
        "***".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let config = config_from(&[
            ("EMBED_API_URL", "https://embed.example.com"),
            ("ARXIV_DB_PATH", "/tmp/papers.db"),
        ])
        .unwrap();

        assert_eq!(config.db_path, "/tmp/papers.db");
        assert_eq!(config.score_threshold.get(), 7);
        assert_eq!(config.poll_interval(), Duration::from_secs(3600));
        assert_eq!(config.arxiv_category, "cs.*");
        assert_eq!(config.fetch_days, 3);
        assert_eq!(config.recent_days, 2);
        assert_eq!(config.max_results, 300);
        assert_eq!(config.claude_model, DEFAULT_CLAUDE_MODEL);
        assert!(config.require_bot().is_err());
        assert!(config.require_scoring().is_err());
    }

    // The only test that touches the process environment.
    #[cfg(unix)]
    #[test]
    fn non_unicode_environment_value_reads_as_unset() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        std::env::set_var("EMBED_API_URL", OsStr::from_bytes(b"https://\xff\xfe"));
        std::env::set_var("ARXIV_BOT_UNRELATED", OsStr::from_bytes(b"\x80"));

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("EMBED_API_URL")));
    }

    #[test]
    fn missing_embed_url_is_an_error() {
        let err = config_from(&[("ARXIV_DB_PATH", "/tmp/papers.db")]).unwrap_err();
        assert!(matches!(err, AppError::Config(msg) if msg.contains("EMBED_API_URL")));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let base = [
            ("EMBED_API_URL", "https://embed.example.com"),
            ("ARXIV_DB_PATH", "/tmp/papers.db"),
        ];

        let mut vars = base.to_vec();
        vars.push(("SCORE_THRESHOLD", "11"));
        assert!(config_from(&vars).is_err());

        let mut vars = base.to_vec();
        vars.push(("DISCORD_CHANNEL_ID", "general"));
        assert!(config_from(&vars).is_err());

        let mut vars = base.to_vec();
        vars.push(("POLL_INTERVAL_MINUTES", "0"));
        assert!(config_from(&vars).is_err());
    }

    #[test]
    fn bot_credentials_are_returned_when_present() {
        let config = config_from(&[
            ("EMBED_API_URL", "https://embed.example.com"),
            ("ARXIV_DB_PATH", "/tmp/papers.db"),
            ("DISCORD_BOT_TOKEN", "abc.def.ghi"),
            ("DISCORD_CHANNEL_ID", "123456789012345678"),
            ("SCORE_THRESHOLD", " 8 "),
        ])
        .unwrap();

        let (token, channel) = config.require_bot().unwrap();
        assert_eq!(token, "abc.def.ghi");
        assert_eq!(channel, 123456789012345678);
        assert_eq!(config.score_threshold.get(), 8);
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret("sk-ant-1234567890"), "sk-ant-1...");
        assert_eq!(mask_secret("short"), "***");
    }
}
