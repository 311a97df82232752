//! アクセラレータ向けコンパイル
//!
//! 量子化済みの TFLite モデルを外部コンパイラに渡し、生成されたバイナリとログを
//! 出力ディレクトリに残す。部分的なコンパイルは扱わない。

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::external::run_tool;
use crate::model::CompilerSettings;

/// コンパイル結果
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModel {
    pub binary: PathBuf,
    pub log: PathBuf,
}

pub struct AcceleratorCompiler {
    settings: CompilerSettings,
}

impl AcceleratorCompiler {
    pub fn new(settings: CompilerSettings) -> Self {
        Self { settings }
    }

    /// コンパイラが実行できるか確認し、バージョン表記を返す
    pub fn preflight(&self) -> Result<String> {
        let output = run_tool(&self.settings.program, ["--version"])?;
        let version = output
            .combined()
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        log::info!("コンパイラ確認: {} ({})", self.settings.program, version);
        Ok(version)
    }

    fn output_stem(&self, input: &Path) -> Result<String> {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid model file name: {}", input.display()))?;
        Ok(format!("{}{}", stem, self.settings.output_suffix))
    }

    /// 生成されるバイナリのパス（入力と同じ拡張子）
    pub fn output_path(&self, input: &Path, output_dir: &Path) -> Result<PathBuf> {
        let mut name = self.output_stem(input)?;
        if let Some(ext) = input.extension().and_then(|e| e.to_str()) {
            name.push('.');
            name.push_str(ext);
        }
        Ok(output_dir.join(name))
    }

    pub fn log_path(&self, input: &Path, output_dir: &Path) -> Result<PathBuf> {
        Ok(output_dir.join(format!("{}.log", self.output_stem(input)?)))
    }

    /// コンパイルを実行
    pub fn compile(&self, input: &Path, output_dir: &Path) -> Result<CompiledModel> {
        let binary = self.output_path(input, output_dir)?;
        let log_file = self.log_path(input, output_dir)?;
        std::fs::create_dir_all(output_dir)?;

        log::info!("コンパイル開始: {} -> {}", input.display(), binary.display());
        let mut args: Vec<String> = self.settings.args.clone();
        args.push("-o".to_string());
        args.push(output_dir.to_string_lossy().into_owned());
        args.push(input.to_string_lossy().into_owned());

        let output = run_tool(&self.settings.program, &args)?;
        std::fs::write(&log_file, output.combined())
            .with_context(|| format!("Failed to write compiler log: {}", log_file.display()))?;

        if !binary.exists() {
            return Err(PipelineError::MissingOutput(binary).into());
        }

        log::info!("コンパイル完了: {}", binary.display());
        Ok(CompiledModel {
            binary,
            log: log_file,
        })
    }
}
