/// DCスクリプト デコンパイラ CLI
///
/// Usage:
///   dc-decompile script.bin
///   dc-decompile script.bin --sidbase sidbase.bin --syntax racket
///   dc-decompile script.bin -f DetermineArgumentType --dot -o out/

use anyhow::{bail, Context, Result};
use clap::Parser;
use dc_decompiler::{BatchDecompiler, DecompilerConfig, FunctionOutput, Syntax};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "dc-decompile")]
#[command(about = "Decompiles DC script containers into readable pseudocode", long_about = None)]
struct Cli {
    /// DC container file
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// SID database (sidbase.bin)
    #[arg(short, long, value_name = "PATH")]
    sidbase: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output syntax (c or racket)
    #[arg(long)]
    syntax: Option<Syntax>,

    /// Only this function
    #[arg(short, long, value_name = "ID")]
    function: Option<String>,

    /// Write one file per function into this directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Result cache directory
    #[arg(long, value_name = "DIR")]
    cache: Option<PathBuf>,

    /// Also emit the control flow graph in DOT format
    #[arg(long)]
    dot: bool,

    /// Prefix each function with its disassembly listing
    #[arg(long)]
    disassembly: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// 既定値 → JSON → 環境変数 → CLI引数
    fn config(&self) -> Result<DecompilerConfig> {
        let mut config = DecompilerConfig::load(self.config.as_deref())?;
        if let Some(path) = &self.sidbase {
            config.sidbase_path = Some(path.clone());
        }
        if let Some(syntax) = self.syntax {
            config.render.syntax = syntax;
        }
        if let Some(dir) = &self.cache {
            config.cache_dir = Some(dir.clone());
        }
        if self.disassembly {
            config.render.emit_disassembly = true;
        }
        if self.verbose {
            config.log_level = "debug".to_string();
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(config.tracing_level())
        .with_writer(std::io::stderr)
        .init();

    let resolver = config.sid_resolver()?;
    let mut batch = BatchDecompiler::new(&resolver, config.render.clone(), config.reconstruct.clone());
    if let Some(dir) = &config.cache_dir {
        batch = batch.with_cache_dir(dir)?;
    }

    info!("decompiling {}", cli.file.display());
    let report = batch.decompile_path(&cli.file, config.image_base)?;

    let selected: Vec<(&String, &Result<FunctionOutput, String>)> = report
        .functions
        .iter()
        .filter(|(id, _)| cli.function.as_deref().map_or(true, |wanted| wanted == id.as_str()))
        .collect();
    if selected.is_empty() {
        match &cli.function {
            Some(wanted) => bail!("function {} not found in {}", wanted, cli.file.display()),
            None => info!("{} contains no script functions", cli.file.display()),
        }
    }

    if let Some(dir) = &cli.output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    }

    let mut failed = 0;
    for (id, result) in selected {
        let output = match result {
            Ok(output) => output,
            Err(message) => {
                error!("{}: {}", id, message);
                failed += 1;
                continue;
            }
        };
        for warning in &output.warnings {
            warn!("{}: {}", id, warning);
        }
        match &cli.output {
            Some(dir) => write_function(dir, id, output, config.render.syntax, cli.dot)?,
            None => {
                println!("{}", output.text);
                if cli.dot {
                    println!("{}", output.dot);
                }
            }
        }
    }

    if failed > 0 {
        error!("{} of {} functions failed to decompile", failed, report.functions.len());
    }
    info!(
        "{} functions, {} failed{}",
        report.functions.len(),
        report.failed(),
        if report.from_cache { " (cached)" } else { "" }
    );
    Ok(())
}

fn write_function(dir: &Path, id: &str, output: &FunctionOutput, syntax: Syntax, dot: bool) -> Result<()> {
    let stem = file_stem(id);
    let extension = match syntax {
        Syntax::C => "c",
        Syntax::Racket => "rkt",
    };
    let path = dir.join(format!("{}.{}", stem, extension));
    std::fs::write(&path, &output.text).with_context(|| format!("failed to write {}", path.display()))?;
    if dot {
        let path = dir.join(format!("{}.dot", stem));
        std::fs::write(&path, &output.dot).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

/// パス区切りなどを含むIDをファイル名にする
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}
