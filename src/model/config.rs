//! パイプライン設定管理モジュール
//!
//! 計算デバイス、データセット、モデル、学習、量子化、コンパイラの設定を
//! JSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::ml::ml_model::{IMAGE_SIZE, NUM_CLASSES};

/// バックボーンが受け付ける最小の入力サイズ
pub const MIN_IMAGE_SIZE: usize = 96;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        if cfg!(feature = "wgpu") {
            DeviceType::Wgpu
        } else {
            DeviceType::Cpu
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            "cpu" | "ndarray" => Ok(DeviceType::Cpu),
            other => Err(anyhow::anyhow!("unknown device type: {}", other)),
        }
    }
}

/// データセットの取得元
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum DatasetSource {
    /// 展開済みのディレクトリ（クラスごとのサブディレクトリを含む）
    Local { path: String },
    /// ローカルのアーカイブファイル (.zip / .tar.gz)
    Archive { path: String },
    /// URLからダウンロードするアーカイブ
    Url { url: String },
    /// Kaggle CLI でダウンロードするデータセット
    Kaggle { dataset: String },
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// 取得元
    pub source: DatasetSource,
    /// ダウンロード・展開先
    pub download_dir: String,
    /// アーカイブ展開後、クラスディレクトリが並ぶ階層までの相対パス
    #[serde(default)]
    pub subdir: Option<String>,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// 検証データの割合
    pub validation_split: f32,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            source: DatasetSource::Kaggle {
                dataset: "asdasdasasdas/garbage-classification".to_string(),
            },
            download_dir: "data".to_string(),
            subdir: Some("Garbage classification/Garbage classification".to_string()),
            image_size: IMAGE_SIZE,
            validation_split: 0.1,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 分類クラス数
    pub num_classes: usize,
    /// MobileNetV2 の幅係数 (alpha)
    pub width_multiplier: f64,
    /// 分類ヘッドの畳み込みフィルタ数
    pub head_filters: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 事前学習済みバックボーンの重み (burn の named mpk レコード)
    #[serde(default)]
    pub pretrained_weights: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            num_classes: NUM_CLASSES,
            width_multiplier: 1.0,
            head_filters: 32,
            dropout: 0.1,
            pretrained_weights: None,
        }
    }
}

/// 1つの学習フェーズの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSettings {
    /// エポック数
    pub num_epochs: usize,
    /// 学習率
    pub learning_rate: f64,
}

/// ファインチューニングフェーズの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneSettings {
    /// エポック数
    pub num_epochs: usize,
    /// 学習率
    pub learning_rate: f64,
    /// このインデックス以降のバックボーン層を学習対象にする
    pub fine_tune_at: usize,
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// バッチサイズ
    pub batch_size: usize,
    /// ランダムシード
    pub seed: u64,
    /// 分類ヘッドのみを学習するフェーズ
    pub head: PhaseSettings,
    /// バックボーン後半も学習するフェーズ
    pub fine_tune: FineTuneSettings,
    /// フェーズ1開始前に読み込むチェックポイント（手動再開用）
    #[serde(default)]
    pub resume_checkpoint: Option<String>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 64,
            seed: 42,
            head: PhaseSettings {
                num_epochs: 10,
                learning_rate: 1e-3,
            },
            fine_tune: FineTuneSettings {
                num_epochs: 10,
                learning_rate: 1e-5,
                fine_tune_at: 11,
            },
            resume_checkpoint: None,
        }
    }
}

/// 量子化設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizationSettings {
    /// 代表データセットのサンプル数
    pub representative_samples: usize,
    /// 代表データ抽出のシード
    pub seed: u64,
}

impl Default for QuantizationSettings {
    fn default() -> Self {
        Self {
            representative_samples: 100,
            seed: 42,
        }
    }
}

/// アクセラレータ用コンパイラ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerSettings {
    /// コンパイル工程を実行するか
    pub enabled: bool,
    /// コンパイラの実行ファイル
    pub program: String,
    /// 追加引数（出力ディレクトリと入力ファイルの前に渡す）
    #[serde(default)]
    pub args: Vec<String>,
    /// 出力ファイル名に付くサフィックス
    pub output_suffix: String,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "edgetpu_compiler".to_string(),
            args: vec!["-s".to_string()],
            output_suffix: "_edgetpu".to_string(),
        }
    }
}

/// 出力設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// 成果物の出力先
    pub dir: String,
    /// 成果物ファイル名のベース
    pub model_name: String,
    /// 成果物のコピー先（任意）
    #[serde(default)]
    pub export_dir: Option<String>,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: "output".to_string(),
            model_name: "si_limbah".to_string(),
            export_dir: None,
        }
    }
}

/// パイプライン全体の設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// データセット設定
    #[serde(default)]
    pub dataset: DatasetSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
    /// 量子化設定
    #[serde(default)]
    pub quantization: QuantizationSettings,
    /// コンパイラ設定
    #[serde(default)]
    pub compiler: CompilerSettings,
    /// 出力設定
    #[serde(default)]
    pub output: OutputSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("pipeline.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 値の範囲を確認する
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |field: &str, reason: String| PipelineError::InvalidConfig {
            field: field.to_string(),
            reason,
        };
        if self.dataset.image_size < MIN_IMAGE_SIZE {
            return Err(invalid(
                "dataset.image_size",
                format!("must be at least {}, got {}", MIN_IMAGE_SIZE, self.dataset.image_size),
            ));
        }
        let split = self.dataset.validation_split;
        if !(0.0..1.0).contains(&split) {
            return Err(PipelineError::InvalidSplit(split));
        }
        if self.model.num_classes == 0 {
            return Err(invalid("model.num_classes", "must be positive".to_string()));
        }
        if self.training.batch_size == 0 {
            return Err(invalid("training.batch_size", "must be positive".to_string()));
        }
        if self.quantization.representative_samples == 0 {
            return Err(invalid(
                "quantization.representative_samples",
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// ファイルが存在するのに読めない場合はエラーにする。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load(path).map_err(|e| {
                anyhow::anyhow!("設定ファイルの読み込みに失敗しました ({}): {}", path.display(), e)
            })?;
            log::info!("設定ファイルを読み込みました: {}", path.display());
            Ok(config)
        } else {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Ok(Self::default())
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 出力ディレクトリ
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output.dir)
    }

    /// 出力ディレクトリ内の成果物パス
    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.output_dir().join(file_name)
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        log::info!("=== パイプライン設定 ===");
        log::info!("計算デバイス: {}", self.device_type);
        log::info!("データセット: {:?}", self.dataset.source);
        log::info!(
            "入力サイズ: {}x{}, 検証割合: {}",
            self.dataset.image_size,
            self.dataset.image_size,
            self.dataset.validation_split
        );
        log::info!(
            "クラス数: {}, 幅係数: {}, ドロップアウト率: {}",
            self.model.num_classes,
            self.model.width_multiplier,
            self.model.dropout
        );
        log::info!(
            "バッチサイズ: {}, シード: {}",
            self.training.batch_size,
            self.training.seed
        );
        log::info!(
            "フェーズ1: {} エポック, 学習率 {}",
            self.training.head.num_epochs,
            self.training.head.learning_rate
        );
        log::info!(
            "フェーズ2: {} エポック, 学習率 {}, fine_tune_at {}",
            self.training.fine_tune.num_epochs,
            self.training.fine_tune.learning_rate,
            self.training.fine_tune.fine_tune_at
        );
        log::info!("出力先: {}", self.output.dir);
    }
}
