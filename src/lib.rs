/// DCスクリプト デコンパイラ ライブラリ
///
/// DCコンテナの読み込み、SID解決、関数単位のデコンパイルを提供

pub mod error;
pub mod sid;
pub mod container;
pub mod config;

// 命令デコードから疑似コード出力まで
pub mod decompiler;

// コンテナ単位の一括処理
pub mod batch;

pub use batch::{BatchDecompiler, BatchReport, FunctionOutput};
pub use config::DecompilerConfig;
pub use container::{DcContainer, ScriptFunction};
pub use decompiler::{decompile_function, DecompiledFunction, RenderOptions, ReconstructOptions, Syntax};
pub use sid::SidResolver;
