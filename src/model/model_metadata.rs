//! モデルメタデータの定義と永続化
//!
//! tar.gz形式の成果物に同梱され、推論時にラベルと入力サイズを復元するのに使います。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin / graph.json + tensors.bin: 重み
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラスラベル（ソート済み、出力インデックス順）
    /// 例: ["cardboard", "glass", "metal", "paper", "plastic", "trash"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（正方形）
    pub image_size: u32,

    /// MobileNetV2 の幅係数
    pub width_multiplier: f64,

    /// 分類ヘッドのフィルタ数
    pub head_filters: usize,

    /// フェーズ1（ヘッドのみ）のエポック数
    pub head_epochs: u32,

    /// フェーズ2（ファインチューニング）のエポック数
    pub fine_tune_epochs: u32,

    /// フェーズ2で学習対象にした最初のバックボーン層
    pub fine_tune_at: usize,

    /// モデルの学習時刻（ISO8601形式）
    ///
    /// 学習済みモデルのバンドルにだけ記録し、変換済みグラフには含めない。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trained_at: Option<String>,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    ///
    /// 学習時刻は空のまま。記録するときは `stamped` を使う。
    pub fn new(
        class_labels: Vec<String>,
        image_size: u32,
        width_multiplier: f64,
        head_filters: usize,
        head_epochs: u32,
        fine_tune_epochs: u32,
        fine_tune_at: usize,
    ) -> Self {
        Self {
            class_labels,
            image_size,
            width_multiplier,
            head_filters,
            head_epochs,
            fine_tune_epochs,
            fine_tune_at,
            trained_at: None,
        }
    }

    /// 現在時刻を学習時刻として記録
    pub fn stamped(self) -> Self {
        Self {
            trained_at: Some(chrono::Local::now().to_rfc3339()),
            ..self
        }
    }

    /// 学習時刻を取り除く
    pub fn without_timestamp(self) -> Self {
        Self {
            trained_at: None,
            ..self
        }
    }

    /// クラス数
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json() {
        let metadata = ModelMetadata::new(
            vec!["glass".to_string(), "paper".to_string()],
            224,
            1.0,
            32,
            10,
            10,
            11,
        );
        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();
        assert_eq!(metadata, restored);
        assert_eq!(restored.num_classes(), 2);
    }

    #[test]
    fn test_timestamp_is_explicit() {
        let metadata = ModelMetadata::new(vec!["glass".to_string()], 96, 0.35, 4, 1, 1, 11);
        assert_eq!(metadata.trained_at, None);
        assert!(!metadata.to_json_string().unwrap().contains("trained_at"));
        assert_eq!(
            metadata,
            ModelMetadata::new(vec!["glass".to_string()], 96, 0.35, 4, 1, 1, 11)
        );

        let stamped = metadata.clone().stamped();
        let json = stamped.to_json_string().unwrap();
        assert!(json.contains("trained_at"));
        assert_eq!(ModelMetadata::from_json_string(&json).unwrap(), stamped);
        assert_eq!(stamped.without_timestamp(), metadata);
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(ModelMetadata::from_json_string("{ \"class_labels\": 3 }").is_err());
    }
}
