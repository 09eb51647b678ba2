use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Runtime configuration, read once at startup from the environment.
///
/// Only `ABY_BOT_TOKEN` is required to talk to a real transport; everything
/// else has a sane default or disables its subsystem when unset (web sync,
/// dictionary refresh, LLM calls).
#[derive(Debug, Clone)]
pub struct Config {
    pub general: General,
    pub transport: Transport,
    pub llm: Llm,
    pub dictionary: Dictionary,
    pub websync: WebSync,
    pub world: World,
    pub glitch: Glitch,
}

#[derive(Debug, Clone)]
pub struct General {
    pub log_level: String,
    pub data_dir: PathBuf,
    pub prometheus_port: u16,
}

#[derive(Debug, Clone)]
pub struct Transport {
    pub token: String,
    pub command_prefix: String,
}

#[derive(Debug, Clone)]
pub struct Llm {
    pub api_key: String,
    pub model: String,
    pub hard_limit_usd: f64,
    pub price_input_per_1k: f64,
    pub price_output_per_1k: f64,
}

#[derive(Debug, Clone)]
pub struct Dictionary {
    pub base_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebSync {
    pub url: Option<String>,
    pub token: Option<String>,
    pub interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct World {
    pub announce_channel_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Glitch {
    pub force: bool,
    pub chance: f64,
    pub split_chance: f64,
    pub max_ratio: f64,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("bad {key}: {raw}")),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            general: General {
                log_level: env_str("ABY_LOG_LEVEL", "info"),
                data_dir: PathBuf::from(env_str("ABY_DATA_DIR", "data")),
                prometheus_port: env_parse("ABY_PROMETHEUS_PORT", 9184)?,
            },
            transport: Transport {
                token: env_str("ABY_BOT_TOKEN", ""),
                command_prefix: env_str("ABY_COMMAND_PREFIX", "!"),
            },
            llm: Llm {
                api_key: env_str("ABY_LLM_API_KEY", ""),
                model: env_str("ABY_LLM_MODEL", "gpt-4o-mini"),
                hard_limit_usd: env_parse("ABY_LLM_LIMIT_USD", 10.0)?,
                price_input_per_1k: env_parse("ABY_LLM_PRICE_INPUT", 0.00015)?,
                price_output_per_1k: env_parse("ABY_LLM_PRICE_OUTPUT", 0.0006)?,
            },
            dictionary: Dictionary {
                base_url: env_opt("ABY_WORDLIST_BASE_URL"),
                token: env_opt("ABY_WORDLIST_TOKEN"),
            },
            websync: WebSync {
                url: env_opt("ABY_WEB_SYNC_URL"),
                token: env_opt("ABY_WEB_SYNC_TOKEN"),
                interval_secs: env_parse("ABY_WEB_SYNC_INTERVAL_SECS", 300)?,
            },
            world: World {
                announce_channel_id: match env_opt("ABY_WEATHER_CHANNEL_ID") {
                    Some(raw) => Some(raw.trim().parse().context("bad ABY_WEATHER_CHANNEL_ID")?),
                    None => None,
                },
            },
            glitch: Glitch {
                force: env_parse("ABY_GLITCH_FORCE", false)?,
                chance: env_parse("ABY_GLITCH_CHANCE", 0.35)?,
                split_chance: env_parse("ABY_GLITCH_SPLIT_CHANCE", 0.15)?,
                max_ratio: env_parse("ABY_GLITCH_MAX_RATIO", 0.20)?,
            },
        })
    }
}

/// Filesystem layout under the data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub storage_dir: PathBuf,
    pub system_dir: PathBuf,
    pub dict_dir: PathBuf,
    pub wordlist_cache_dir: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            storage_dir: data_dir.join("storage"),
            system_dir: data_dir.join("system"),
            dict_dir: data_dir.join("dictionary"),
            wordlist_cache_dir: data_dir.join("cache").join("wordlists"),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.storage_dir,
            &self.system_dir,
            &self.dict_dir,
            &self.wordlist_cache_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create dir {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn db_file(&self) -> PathBuf {
        self.storage_dir.join("bot.db")
    }

    pub fn llm_usage_file(&self) -> PathBuf {
        self.system_dir.join("llm_usage.json")
    }

    pub fn status_messages_file(&self) -> PathBuf {
        self.system_dir.join("status_messages.json")
    }

    pub fn words_file(&self) -> PathBuf {
        self.dict_dir.join("blue_archive_words.txt")
    }

    pub fn suggestions_file(&self) -> PathBuf {
        self.dict_dir.join("suggestion.txt")
    }

    pub fn phonetic_rules_file(&self) -> PathBuf {
        self.dict_dir.join("phonetic_rules.txt")
    }

    pub fn cached_words_file(&self) -> PathBuf {
        self.wordlist_cache_dir.join("blue_archive_words.txt")
    }

    pub fn cached_suggestions_file(&self) -> PathBuf {
        self.wordlist_cache_dir.join("suggestion.txt")
    }

    pub fn wordlist_meta_file(&self) -> PathBuf {
        self.wordlist_cache_dir.join("meta.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_paths_layout() {
        let paths = DataPaths::new(Path::new("/tmp/aby"));
        assert_eq!(paths.db_file(), PathBuf::from("/tmp/aby/storage/bot.db"));
        assert_eq!(
            paths.wordlist_meta_file(),
            PathBuf::from("/tmp/aby/cache/wordlists/meta.json")
        );
    }

    #[test]
    fn test_env_parse_falls_back_to_default() {
        assert_eq!(env_parse("ABY_TEST_MISSING_KEY", 42u64).unwrap(), 42);
    }
}
