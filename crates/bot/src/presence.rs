use anyhow::Result;
use common::calendar::{current_time_band, TimeBand};
use common::transport::{Outbound, PresenceKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub bands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntervalMinutes {
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusConfig {
    pub interval_minutes: IntervalMinutes,
    pub items: Vec<StatusItem>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        let item = |kind: &str, text: &str, bands: &[&str]| StatusItem {
            kind: kind.to_string(),
            text: text.to_string(),
            bands: bands.iter().map(ToString::to_string).collect(),
        };
        Self {
            interval_minutes: IntervalMinutes { min: 35, max: 95 },
            items: vec![
                item("playing", "pretending to do council work", &["morning", "day"]),
                item("playing", "brain still loading…", &["night", "evening"]),
                item("watching", "morning roll call", &["morning", "day"]),
                item("watching", "the juniors chatting", &["evening", "night"]),
                item("listening", "a long sigh", &["evening", "night"]),
                item("playing", "fighting the timetable", &["morning", "day"]),
                item("playing", "planning a nap", &["evening", "night"]),
                item("watching", "budget sheets", &["morning", "day"]),
                item("playing", "checking the Abydos weather", &["morning", "day", "evening", "night"]),
            ],
        }
    }
}

/// Load the status config, writing the defaults on first run so operators
/// have a file to edit.
pub fn load_config(path: &Path) -> StatusConfig {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<StatusConfig>(&text) {
            Ok(config) if !config.items.is_empty() => return config,
            Ok(_) => tracing::warn!(path = %path.display(), "status config has no items, using defaults"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "status config unreadable, using defaults"),
        },
        Err(_) => {
            let config = StatusConfig::default();
            if let Err(e) = write_default(path, &config) {
                tracing::debug!(error = %e, "could not seed status config file");
            }
            return config;
        }
    }
    StatusConfig::default()
}

fn write_default(path: &Path, config: &StatusConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(config)?)?;
    Ok(())
}

pub fn pick_interval(config: &StatusConfig, rng: &mut impl Rng) -> std::time::Duration {
    let min = config.interval_minutes.min.max(10);
    let max = config.interval_minutes.max.max(min);
    std::time::Duration::from_secs(rng.gen_range(min..=max) * 60)
}

/// Pick an item valid for the band; items with no bands match everywhere.
pub fn pick_item<'a>(
    config: &'a StatusConfig,
    band: TimeBand,
    rng: &mut impl Rng,
) -> Option<&'a StatusItem> {
    if config.items.is_empty() {
        return None;
    }
    let band = band.as_str();
    let candidates: Vec<&StatusItem> = config
        .items
        .iter()
        .filter(|it| it.bands.is_empty() || it.bands.iter().any(|b| b == band))
        .collect();
    if candidates.is_empty() {
        return config.items.get(rng.gen_range(0..config.items.len()));
    }
    Some(candidates[rng.gen_range(0..candidates.len())])
}

/// Presence rotation loop: apply one status now, then again every
/// `uniform[35, 95]` minutes (per the config). The file is re-read each
/// round so edits land without a restart.
pub async fn run_loop(path: std::path::PathBuf, out: Outbound, cancel: CancellationToken) {
    loop {
        let config = load_config(&path);
        let sleep_for = {
            let mut rng = rand::thread_rng();
            if let Some(item) = pick_item(&config, current_time_band(), &mut rng) {
                out.presence(
                    PresenceKind::from_str_loose(&item.kind),
                    item.text.replace('@', "@\u{200b}"),
                );
            }
            pick_interval(&config, &mut rng)
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}
