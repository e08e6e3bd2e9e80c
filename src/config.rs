use crate::error::ConfigError;
use clap::Parser;
use reqwest::header::HeaderValue;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "chat-stream-bench")]
#[command(about = "Streaming chat-completion load generator", long_about = None)]
pub struct Config {
    /// Target base URL, e.g. https://gateway.example.com
    #[arg(long, env = "TARGET_HOST")]
    pub host: Option<String>,

    /// Chat completion endpoint path
    #[arg(long, env = "OPENAI_CHAT_PATH", default_value = "/ai/proxy/v1/chat/completions")]
    pub path: String,

    /// Model name sent in the payload
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,

    /// Percent chance (0-100) that a request carries sensitive content
    #[arg(long, env = "PERCENT_SENSITIVE", default_value = "30")]
    pub percent_sensitive: u8,

    /// Connect timeout in seconds
    #[arg(long, env = "CONNECT_TIMEOUT", default_value = "1.0")]
    pub connect_timeout: f64,

    /// Read timeout in seconds, applied to the header wait and to every body read
    #[arg(long, env = "READ_TIMEOUT", default_value = "30.0")]
    pub read_timeout: f64,

    /// Bearer token; the Authorization header is only sent when non-empty
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Sensitive word dictionary file
    #[arg(long, env = "SENSITIVE_DICT")]
    pub sensitive_dict: Option<PathBuf>,

    /// Minimum number of dictionary words per sensitive prompt
    #[arg(long, env = "DICT_SAMPLE_MIN", default_value = "1")]
    pub dict_sample_min: usize,

    /// Maximum number of dictionary words per sensitive prompt
    #[arg(long, env = "DICT_SAMPLE_MAX", default_value = "3")]
    pub dict_sample_max: usize,

    /// Number of virtual users
    #[arg(long, env = "NUM_USERS", default_value = "10")]
    pub users: usize,

    /// Users started per second during ramp-up
    #[arg(long, env = "SPAWN_RATE", default_value = "1.0")]
    pub spawn_rate: f64,

    /// Seconds to hold at full user count once ramp-up is done
    #[arg(long, env = "RUN_TIME", default_value = "60")]
    pub run_time: u64,

    /// Seconds between the starts of consecutive attempts of one user
    #[arg(long, env = "PACING_INTERVAL", default_value = "1.0")]
    pub pacing: f64,

    /// Seconds to wait for in-flight attempts after shutdown is signalled
    #[arg(long, env = "SHUTDOWN_GRACE", default_value = "30")]
    pub shutdown_grace: u64,
}

/// Validated, ready-to-use configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoint: Url,
    pub model: String,
    pub percent_sensitive: u8,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub bearer: Option<HeaderValue>,
    pub sensitive_dict: Option<PathBuf>,
    pub dict_sample_min: usize,
    pub dict_sample_max: usize,
    pub users: usize,
    pub spawn_rate: f64,
    pub run_time: Duration,
    pub pacing: Duration,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        let host = self
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::MissingHost)?;

        let endpoint = join_url(host, &self.path)?;

        if self.percent_sensitive > 100 {
            return Err(ConfigError::InvalidRatio(self.percent_sensitive));
        }

        if self.dict_sample_min == 0 || self.dict_sample_min > self.dict_sample_max {
            return Err(ConfigError::InvalidSampleRange {
                min: self.dict_sample_min,
                max: self.dict_sample_max,
            });
        }

        if self.users == 0 {
            return Err(ConfigError::NoUsers);
        }

        if !(self.spawn_rate.is_finite() && self.spawn_rate > 0.0) {
            return Err(ConfigError::InvalidRate {
                name: "spawn rate",
                value: self.spawn_rate,
            });
        }

        let token = self.api_key.trim();
        let bearer = if token.is_empty() {
            None
        } else {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ConfigError::InvalidToken)?;
            value.set_sensitive(true);
            Some(value)
        };

        Ok(Settings {
            endpoint,
            model: self.model,
            percent_sensitive: self.percent_sensitive,
            connect_timeout: seconds("connect timeout", self.connect_timeout)?,
            read_timeout: seconds("read timeout", self.read_timeout)?,
            bearer,
            sensitive_dict: self.sensitive_dict,
            dict_sample_min: self.dict_sample_min,
            dict_sample_max: self.dict_sample_max,
            users: self.users,
            spawn_rate: self.spawn_rate,
            run_time: Duration::from_secs(self.run_time),
            pacing: seconds("pacing interval", self.pacing)?,
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
        })
    }
}

fn seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(value) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(ConfigError::InvalidDuration { name, value }),
    }
}

/// Joins a base URL and an endpoint path with exactly one `/` between them.
pub fn join_url(base: &str, path: &str) -> Result<Url, ConfigError> {
    let base = format!("{}/", base.trim_end_matches('/'));
    let invalid = |source| ConfigError::InvalidUrl {
        url: base.clone(),
        source,
    };
    Url::parse(&base)
        .map_err(invalid)?
        .join(path.trim_start_matches('/'))
        .map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, FromArgMatches};

    /// Parses flags only. Env bindings are removed so the caller's environment
    /// (e.g. an exported TARGET_HOST) cannot change the result.
    fn config(args: &[&str]) -> Config {
        let mut argv = vec!["chat-stream-bench"];
        argv.extend_from_slice(args);
        let matches = Config::command()
            .mut_args(|arg| arg.env(None::<&'static str>))
            .try_get_matches_from(argv)
            .unwrap();
        Config::from_arg_matches(&matches).unwrap()
    }

    #[test]
    fn join_url_normalizes_separator() {
        let a = join_url("https://h.example/", "ai/x").unwrap();
        let b = join_url("https://h.example", "/ai/x").unwrap();
        let c = join_url("https://h.example//", "//ai/x").unwrap();
        assert_eq!(a.as_str(), "https://h.example/ai/x");
        assert_eq!(b.as_str(), "https://h.example/ai/x");
        assert_eq!(c.as_str(), "https://h.example/ai/x");
    }

    #[test]
    fn join_url_keeps_base_path_prefix() {
        let url = join_url("http://127.0.0.1:8080/gateway", "/v1/chat").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/gateway/v1/chat");
    }

    #[test]
    fn join_url_rejects_garbage() {
        assert!(matches!(
            join_url("not a url", "/x"),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn missing_host_is_fatal() {
        let parsed = config(&[]);
        assert_eq!(parsed.host, None);
        let err = parsed.into_settings().unwrap_err();
        assert!(matches!(err, ConfigError::MissingHost));

        let mut parsed = config(&["--host", "http://h"]);
        parsed.host = None;
        let err = parsed.into_settings().unwrap_err();
        assert!(matches!(err, ConfigError::MissingHost));

        let err = config(&["--host", "   "]).into_settings().unwrap_err();
        assert!(matches!(err, ConfigError::MissingHost));
    }

    #[test]
    fn defaults_resolve() {
        let settings = config(&["--host", "http://localhost:9000"])
            .into_settings()
            .unwrap();
        assert_eq!(
            settings.endpoint.as_str(),
            "http://localhost:9000/ai/proxy/v1/chat/completions"
        );
        assert_eq!(settings.model, "gpt-4o-mini");
        assert_eq!(settings.percent_sensitive, 30);
        assert_eq!(settings.connect_timeout, Duration::from_secs(1));
        assert_eq!(settings.read_timeout, Duration::from_secs(30));
        assert!(settings.bearer.is_none());
        assert_eq!((settings.dict_sample_min, settings.dict_sample_max), (1, 3));
        assert_eq!(settings.pacing, Duration::from_secs(1));
    }

    #[test]
    fn blank_token_sends_no_header() {
        let settings = config(&["--host", "http://h", "--api-key", "  "])
            .into_settings()
            .unwrap();
        assert!(settings.bearer.is_none());

        let settings = config(&["--host", "http://h", "--api-key", "sk-test"])
            .into_settings()
            .unwrap();
        assert_eq!(settings.bearer.unwrap().to_str().unwrap(), "Bearer sk-test");
    }

    #[test]
    fn rejects_bad_ranges_and_timeouts() {
        let err = config(&["--host", "http://h", "--dict-sample-min", "4"])
            .into_settings()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSampleRange { min: 4, max: 3 }));

        let err = config(&["--host", "http://h", "--dict-sample-min", "0"])
            .into_settings()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSampleRange { .. }));

        let err = config(&["--host", "http://h", "--read-timeout", "0"])
            .into_settings()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));

        let err = config(&["--host", "http://h", "--connect-timeout=-1"])
            .into_settings()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { .. }));

        let err = config(&["--host", "http://h", "--percent-sensitive", "101"])
            .into_settings()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRatio(101)));
    }
}
