/// コンテナ単位の一括デコンパイルとキャッシュ
///
/// 関数ごとに独立に処理する。`parallel` フィーチャ有効時はrayonで並列化。
/// デコードに失敗した関数は記録して残りを続ける。
/// 結果はコンテナのバイト列と設定のxxh3ハッシュをキーにJSONでディスクに保存する。

use crate::container::{DcContainer, Entry};
use crate::decompiler::pipeline::decompile_function;
use crate::decompiler::printer::RenderOptions;
use crate::decompiler::structurer::ReconstructOptions;
use crate::sid::SidResolver;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::Xxh3;

/// 1関数の出力
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionOutput {
    pub id: String,
    pub signature: String,
    /// 描画済みの疑似コード
    pub text: String,
    /// CFGのDOT表現
    pub dot: String,
    pub flattened: bool,
    pub warnings: Vec<String>,
}

/// コンテナ全体の結果。キャッシュファイルの中身でもある
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub container_hash: String,
    /// 関数ID → 結果（失敗ならエラーメッセージ）
    pub functions: IndexMap<String, Result<FunctionOutput, String>>,
    #[serde(skip)]
    pub from_cache: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.functions.values().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.functions.values().filter(|r| r.is_err()).count()
    }
}

/// 一括デコンパイラ
pub struct BatchDecompiler<'a> {
    resolver: &'a SidResolver,
    render: RenderOptions,
    reconstruct: ReconstructOptions,
    cache_dir: Option<PathBuf>,
}

impl<'a> BatchDecompiler<'a> {
    pub fn new(resolver: &'a SidResolver, render: RenderOptions, reconstruct: ReconstructOptions) -> Self {
        Self {
            resolver,
            render,
            reconstruct,
            cache_dir: None,
        }
    }

    /// キャッシュを有効にする
    pub fn with_cache_dir<P: AsRef<Path>>(mut self, cache_dir: P) -> Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("failed to create cache directory {}", cache_dir.display()))?;
        self.cache_dir = Some(cache_dir);
        Ok(self)
    }

    /// コンテナのバイト列と設定のハッシュ
    pub fn cache_key(&self, bytes: &[u8]) -> String {
        let mut hasher = Xxh3::new();
        hasher.update(&bytes.len().to_le_bytes());
        hasher.update(bytes);
        // 設定が変われば別のキャッシュ
        if let Ok(options) = serde_json::to_vec(&(&self.render, &self.reconstruct)) {
            hasher.update(&options);
        }
        format!("{:016x}", hasher.digest())
    }

    fn cache_path(&self, key: &str) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(format!("{}.json", key)))
    }

    pub fn load_cache(&self, key: &str) -> Option<BatchReport> {
        let path = self.cache_path(key)?;
        let data = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<BatchReport>(&data) {
            Ok(mut report) if report.container_hash == key => {
                report.from_cache = true;
                Some(report)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("ignoring unreadable cache {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn save_cache(&self, report: &BatchReport) -> Result<()> {
        let Some(path) = self.cache_path(&report.container_hash) else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write cache {}", path.display()))?;
        debug!("cached {} functions at {}", report.functions.len(), path.display());
        Ok(())
    }

    /// ファイルから読み込んで一括処理
    pub fn decompile_path<P: AsRef<Path>>(&self, path: P, image_base: u64) -> Result<BatchReport> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let key = self.cache_key(&bytes);
        if let Some(report) = self.load_cache(&key) {
            info!("{}: using cached results ({} functions)", path.display(), report.functions.len());
            return Ok(report);
        }
        let container = DcContainer::from_bytes_with_base(bytes, image_base)
            .with_context(|| format!("failed to load {}", path.display()))?;
        let report = self.run(&container, key)?;
        self.save_cache(&report)?;
        Ok(report)
    }

    /// メモリ上のバイト列から一括処理
    pub fn decompile_bytes(&self, bytes: Vec<u8>, image_base: u64) -> Result<BatchReport> {
        let key = self.cache_key(&bytes);
        if let Some(report) = self.load_cache(&key) {
            return Ok(report);
        }
        let container = DcContainer::from_bytes_with_base(bytes, image_base)?;
        let report = self.run(&container, key)?;
        self.save_cache(&report)?;
        Ok(report)
    }

    /// 読み込み済みのコンテナを処理（キャッシュなし）
    pub fn decompile_container(&self, container: &DcContainer) -> Result<BatchReport> {
        let key = self.cache_key(&container.get_unmapped());
        self.run(container, key)
    }

    fn run(&self, container: &DcContainer, container_hash: String) -> Result<BatchReport> {
        let entries: Vec<Entry> = container
            .entries()
            .context("failed to read entry table")?
            .into_iter()
            .filter(Entry::is_script_lambda)
            .collect();

        #[cfg(feature = "parallel")]
        let outputs: Vec<(String, Result<FunctionOutput, String>)> = {
            use rayon::prelude::*;
            entries
                .par_iter()
                .map(|entry| self.decompile_entry(container, entry))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let outputs: Vec<(String, Result<FunctionOutput, String>)> = entries
            .iter()
            .map(|entry| self.decompile_entry(container, entry))
            .collect();

        let mut functions = IndexMap::with_capacity(outputs.len());
        for (index, (id, result)) in outputs.into_iter().enumerate() {
            let id = if functions.contains_key(&id) {
                format!("{}#{}", id, index)
            } else {
                id
            };
            functions.insert(id, result);
        }

        let report = BatchReport {
            container_hash,
            functions,
            from_cache: false,
        };
        info!(
            "decompiled {} functions ({} failed)",
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }

    fn decompile_entry(&self, container: &DcContainer, entry: &Entry) -> (String, Result<FunctionOutput, String>) {
        let id = self.resolver.resolve(entry.name_hash).to_string();
        let result = container
            .script_function(entry)
            .and_then(|function| decompile_function(container, &function, self.resolver, &self.reconstruct));
        match result {
            Ok(function) => {
                let output = FunctionOutput {
                    id: function.id().to_string(),
                    signature: function.signature(),
                    text: function.render(self.resolver, &self.render),
                    dot: function.to_dot(),
                    flattened: function.flattened,
                    warnings: function.warnings.iter().map(ToString::to_string).collect(),
                };
                (id, Ok(output))
            }
            Err(e) => {
                error!("{}: {}", id, e);
                (id, Err(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::tests_support::{ImageBuilder, SymbolImage};
    use crate::decompiler::instruction::{Instruction, Opcode};
    use crate::sid::SidTable;
    use crate::container::DEFAULT_IMAGE_BASE;

    fn image() -> Vec<u8> {
        ImageBuilder::new()
            .function(
                "answer",
                &[
                    Instruction::new(Opcode::LoadStaticInt, 0, 0, 0),
                    Instruction::new(Opcode::Return, 0, 0, 0),
                ],
                vec![SymbolImage::Value(42)],
            )
            .function(
                "broken",
                &[Instruction::new(Opcode::Return, 0, 0, 0)],
                vec![],
            )
            .build()
    }

    fn resolver() -> SidResolver {
        let table: SidTable = ["answer", "broken"].into_iter().collect();
        SidResolver::with_backend(Box::new(table))
    }

    #[test]
    fn test_failures_are_recorded_per_function() -> anyhow::Result<()> {
        let mut raw = image();
        let container = DcContainer::from_bytes(raw.clone())?;
        let broken = container.script_functions()?[1];
        raw[broken.instructions_offset as usize] = 0xF0;

        let resolver = resolver();
        let batch = BatchDecompiler::new(&resolver, RenderOptions::default(), ReconstructOptions::default());
        let report = batch.decompile_bytes(raw, DEFAULT_IMAGE_BASE)?;

        assert_eq!(report.functions.keys().collect::<Vec<_>>(), vec!["answer", "broken"]);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        let answer = report.functions["answer"].as_ref().map_err(|e| anyhow::anyhow!(e.clone()))?;
        assert!(answer.text.contains("return 42;"), "{}", answer.text);
        assert!(answer.dot.contains("digraph"));
        assert!(matches!(&report.functions["broken"], Err(message) if message.contains("unknown opcode")));
        Ok(())
    }

    #[test]
    fn test_cache_roundtrip() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join("dc_decompiler_batch_cache_test");
        let _ = std::fs::remove_dir_all(&dir);
        let resolver = resolver();
        let batch = BatchDecompiler::new(&resolver, RenderOptions::default(), ReconstructOptions::default())
            .with_cache_dir(&dir)?;

        let first = batch.decompile_bytes(image(), DEFAULT_IMAGE_BASE)?;
        assert!(!first.from_cache);
        let second = batch.decompile_bytes(image(), DEFAULT_IMAGE_BASE)?;
        assert!(second.from_cache);
        assert_eq!(first.functions, second.functions);

        // 設定が違えば別のキー
        let racket = BatchDecompiler::new(
            &resolver,
            RenderOptions {
                syntax: crate::decompiler::printer::Syntax::Racket,
                ..RenderOptions::default()
            },
            ReconstructOptions::default(),
        );
        assert_ne!(racket.cache_key(&image()), batch.cache_key(&image()));

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
