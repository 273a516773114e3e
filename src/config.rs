/// 設定
///
/// 優先順位（低→高）: 組み込みの既定値、JSONファイル、環境変数、CLI引数。
/// CLI引数の反映は `main.rs` が行う。

use crate::container::DEFAULT_IMAGE_BASE;
use crate::decompiler::printer::RenderOptions;
use crate::decompiler::structurer::ReconstructOptions;
use crate::sid::{SidBase, SidResolver};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, Level};

pub const ENV_SIDBASE: &str = "DC_SIDBASE";
pub const ENV_CACHE_DIR: &str = "DC_CACHE_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompilerConfig {
    /// sidbase.bin のパス
    pub sidbase_path: Option<PathBuf>,
    pub image_base: u64,
    pub render: RenderOptions,
    pub reconstruct: ReconstructOptions,
    /// 結果キャッシュの置き場所。`None` ならキャッシュしない
    pub cache_dir: Option<PathBuf>,
    /// error / warn / info / debug / trace
    pub log_level: String,
}

impl Default for DecompilerConfig {
    fn default() -> Self {
        Self {
            sidbase_path: None,
            image_base: DEFAULT_IMAGE_BASE,
            render: RenderOptions::default(),
            reconstruct: ReconstructOptions::default(),
            cache_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl DecompilerConfig {
    /// 既定値 → JSON → 環境変数
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// 環境変数の上書き。取得関数を差し替えられるようにしてある
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(path) = get(ENV_SIDBASE).filter(|v| !v.is_empty()) {
            self.sidbase_path = Some(PathBuf::from(path));
        }
        if let Some(path) = get(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            self.cache_dir = Some(PathBuf::from(path));
        }
    }

    /// 未知の値は `INFO`
    pub fn tracing_level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }

    /// sidbase が指定されていればそれを使うリゾルバ
    pub fn sid_resolver(&self) -> Result<SidResolver> {
        match &self.sidbase_path {
            Some(path) => {
                let base = SidBase::from_path(path)
                    .with_context(|| format!("failed to load sidbase {}", path.display()))?;
                debug!("sidbase {}: {} names", path.display(), base.len());
                Ok(SidResolver::with_backend(Box::new(base)))
            }
            None => Ok(SidResolver::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompiler::printer::Syntax;

    #[test]
    fn test_partial_json_keeps_defaults() -> anyhow::Result<()> {
        let config: DecompilerConfig =
            serde_json::from_str(r#"{ "render": { "syntax": "racket" }, "log_level": "debug" }"#)?;
        assert_eq!(config.render.syntax, Syntax::Racket);
        assert_eq!(config.render.indent_width, 4);
        assert_eq!(config.image_base, DEFAULT_IMAGE_BASE);
        assert!(config.reconstruct.fold_constants);
        assert_eq!(config.tracing_level(), Level::DEBUG);
        Ok(())
    }

    #[test]
    fn test_env_overrides_file() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join("dc_decompiler_config_test");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("config.json");
        std::fs::write(&path, r#"{ "sidbase_path": "from-file.bin", "cache_dir": "cache" }"#)?;

        let mut config = DecompilerConfig::from_json_file(&path)?;
        assert_eq!(config.sidbase_path, Some(PathBuf::from("from-file.bin")));

        config.apply_env(|key| match key {
            ENV_SIDBASE => Some("from-env.bin".to_string()),
            ENV_CACHE_DIR => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.sidbase_path, Some(PathBuf::from("from-env.bin")));
        // 空の値は無視
        assert_eq!(config.cache_dir, Some(PathBuf::from("cache")));

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn test_bad_config_and_missing_sidbase() {
        assert!(DecompilerConfig::from_json_file(Path::new("/nonexistent/dc.json")).is_err());
        let config = DecompilerConfig {
            sidbase_path: Some(PathBuf::from("/nonexistent/sidbase.bin")),
            ..DecompilerConfig::default()
        };
        assert!(config.sid_resolver().is_err());
        assert_eq!(
            DecompilerConfig {
                log_level: "loud".to_string(),
                ..DecompilerConfig::default()
            }
            .tracing_level(),
            Level::INFO
        );
    }
}
