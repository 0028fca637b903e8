//! Engine configuration: additive TOML + environment + compiled-default
//! layering, following `chorus_common::config::RootFolderResolver`'s
//! CLI > env > TOML > default priority, generalized to every recognized key.

use chorus_common::config::{RootFolderInitializer, RootFolderResolver};
use chorus_common::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Per-stage worker pool sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub fetch: usize,
    pub analyze: usize,
    pub extract: usize,
    pub post_extract: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            fetch: 4,
            analyze: 2,
            extract: 1,
            post_extract: 2,
        }
    }
}

/// Per-stage wall-clock timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeoutConfig {
    pub fetch: u64,
    pub analyze: u64,
    pub extract: u64,
    pub post_extract: u64,
}

impl Default for StageTimeoutConfig {
    fn default() -> Self {
        Self {
            fetch: 600,
            analyze: 900,
            extract: 1800,
            post_extract: 900,
        }
    }
}

/// The full recognized configuration set from §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub downloads_root: PathBuf,
    pub concurrency: ConcurrencyConfig,
    pub prefer_gpu: bool,
    pub gpu_slots: usize,
    pub default_separator_model: String,
    pub allowed_separator_models: Vec<String>,
    pub chord_backend_order: Vec<String>,
    pub lyrics_asr_enabled: bool,
    pub lyrics_asr_model_size: String,
    pub silent_stem_threshold_db: f64,
    pub stage_timeout_seconds: StageTimeoutConfig,
    pub max_source_duration_seconds: u64,
    pub upload_max_bytes: u64,
    pub rate_limited_max_retries: u32,
    pub rate_limited_backoff_seconds: u64,
    /// Capacity of each Progress Bus room's broadcast buffer.
    pub progress_room_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            downloads_root: PathBuf::from("chorus-data"),
            concurrency: ConcurrencyConfig::default(),
            prefer_gpu: false,
            gpu_slots: 0,
            default_separator_model: "four_stem_v1".to_string(),
            allowed_separator_models: vec!["four_stem_v1".to_string(), "six_stem_v1".to_string()],
            chord_backend_order: vec![
                "primary".to_string(),
                "secondary".to_string(),
                "hybrid".to_string(),
            ],
            lyrics_asr_enabled: true,
            lyrics_asr_model_size: "base".to_string(),
            silent_stem_threshold_db: -40.0,
            stage_timeout_seconds: StageTimeoutConfig::default(),
            max_source_duration_seconds: 3600 * 3,
            upload_max_bytes: 500 * 1024 * 1024,
            rate_limited_max_retries: 3,
            rate_limited_backoff_seconds: 5,
            progress_room_capacity: 1000,
        }
    }
}

/// File-backed overlay read from the TOML config file, CLI arg, or env var,
/// layered CLI > env > TOML > compiled default per key.
#[derive(Debug, Default, Deserialize)]
struct TomlOverlay {
    downloads_root: Option<PathBuf>,
    prefer_gpu: Option<bool>,
    gpu_slots: Option<usize>,
    default_separator_model: Option<String>,
    chord_backend_order: Option<Vec<String>>,
    lyrics_asr_enabled: Option<bool>,
    silent_stem_threshold_db: Option<f64>,
    max_source_duration_seconds: Option<u64>,
    upload_max_bytes: Option<u64>,
}

impl EngineConfig {
    /// Resolve the root folder the same way every `wkmp-*`-style service
    /// does, then layer the rest of `EngineConfig`'s recognized keys from
    /// the TOML file found alongside it, falling back to compiled defaults.
    pub async fn resolve(cli_downloads_root: Option<PathBuf>) -> chorus_common::Result<Self> {
        let mut config = EngineConfig::default();

        let resolver = RootFolderResolver::new("chorus-engine").with_cli_arg(
            cli_downloads_root
                .as_ref()
                .and_then(|p| p.to_str())
                .map(str::to_string),
        );
        let root = resolver.resolve();
        let initializer = RootFolderInitializer::new(root);
        initializer.ensure_directory_exists()?;
        config.downloads_root = initializer.root().to_path_buf();

        if let Some(overlay) = Self::load_toml_overlay(&config.downloads_root) {
            config.apply_overlay(overlay);
        }

        if let Ok(val) = std::env::var("CHORUS_PREFER_GPU") {
            config.prefer_gpu = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Ok(val) = std::env::var("CHORUS_GPU_SLOTS") {
            if let Ok(n) = val.parse() {
                config.gpu_slots = n;
            }
        }

        info!(root = %config.downloads_root.display(), "engine configuration resolved");
        Ok(config)
    }

    fn load_toml_overlay(root: &std::path::Path) -> Option<TomlOverlay> {
        let path = root.join("chorus-engine.toml");
        let content = std::fs::read_to_string(path).ok()?;
        toml::from_str(&content).ok()
    }

    fn apply_overlay(&mut self, overlay: TomlOverlay) {
        if let Some(v) = overlay.downloads_root {
            self.downloads_root = v;
        }
        if let Some(v) = overlay.prefer_gpu {
            self.prefer_gpu = v;
        }
        if let Some(v) = overlay.gpu_slots {
            self.gpu_slots = v;
        }
        if let Some(v) = overlay.default_separator_model {
            self.default_separator_model = v;
        }
        if let Some(v) = overlay.chord_backend_order {
            self.chord_backend_order = v;
        }
        if let Some(v) = overlay.lyrics_asr_enabled {
            self.lyrics_asr_enabled = v;
        }
        if let Some(v) = overlay.silent_stem_threshold_db {
            self.silent_stem_threshold_db = v;
        }
        if let Some(v) = overlay.max_source_duration_seconds {
            self.max_source_duration_seconds = v;
        }
        if let Some(v) = overlay.upload_max_bytes {
            self.upload_max_bytes = v;
        }
    }

    pub fn max_concurrency(&self, stage: Stage) -> usize {
        match stage {
            Stage::Fetch => self.concurrency.fetch,
            Stage::Analyze => self.concurrency.analyze,
            Stage::Extract => self.concurrency.extract,
            Stage::PostExtract => self.concurrency.post_extract,
        }
    }

    pub fn stage_timeout(&self, stage: Stage) -> std::time::Duration {
        let secs = match stage {
            Stage::Fetch => self.stage_timeout_seconds.fetch,
            Stage::Analyze => self.stage_timeout_seconds.analyze,
            Stage::Extract => self.stage_timeout_seconds.extract,
            Stage::PostExtract => self.stage_timeout_seconds.post_extract,
        };
        std::time::Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_concurrency_matches_documented_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency.extract, 1);
        assert_eq!(config.gpu_slots, 0);
    }

    #[test]
    fn overlay_only_replaces_present_fields() {
        let mut config = EngineConfig::default();
        let overlay = TomlOverlay {
            prefer_gpu: Some(true),
            ..Default::default()
        };
        config.apply_overlay(overlay);
        assert!(config.prefer_gpu);
        assert_eq!(config.default_separator_model, "four_stem_v1");
    }
}
