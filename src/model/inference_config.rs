//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use std::path::Path;

use crate::model::model_metadata::ModelMetadata;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// クラスラベル（出力インデックス順）
    pub class_labels: Vec<String>,

    /// モデル入力解像度
    pub model_input_size: u32,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_labels: metadata.class_labels.clone(),
            model_input_size: metadata.image_size,
        }
    }

    /// クラス数を取得
    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// 入力サイズ（usize）
    pub fn input_size(&self) -> usize {
        self.model_input_size as usize
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.class_labels.get(index).map(String::as_str)
    }

    /// ラベルからクラスインデックスを取得
    pub fn label_to_index(&self, label: &str) -> Option<usize> {
        self.class_labels.iter().position(|l| l == label)
    }

    /// 画像の親ディレクトリ名が既知のラベルなら、そのクラスインデックス
    ///
    /// `data/metal/metal3.png` のようにクラスごとに並べた画像の正解を得る。
    pub fn label_index_for_path(&self, path: &Path) -> Option<usize> {
        let class = path.parent()?.file_name()?.to_str()?;
        self.label_to_index(class)
    }

    /// 設定情報をログに出力
    pub fn print_info(&self) {
        log::info!("=== 推論設定 ===");
        log::info!("クラスラベル: {}", self.class_labels.join(", "));
        log::info!(
            "モデル入力サイズ: {}x{}",
            self.model_input_size,
            self.model_input_size
        );
        log::info!("総クラス数: {}", self.num_classes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_lookup() {
        let metadata = ModelMetadata::new(
            vec!["cardboard".into(), "glass".into(), "metal".into()],
            224,
            1.0,
            32,
            10,
            10,
            11,
        );
        let config = InferenceConfig::from_metadata(&metadata);
        assert_eq!(config.num_classes(), 3);
        assert_eq!(config.class_index_to_label(1), Some("glass"));
        assert_eq!(config.class_index_to_label(3), None);
        assert_eq!(config.label_to_index("metal"), Some(2));
        assert_eq!(config.input_size(), 224);
    }

    #[test]
    fn test_label_from_parent_directory() {
        let metadata = ModelMetadata::new(
            vec!["cardboard".into(), "glass".into(), "metal".into()],
            224,
            1.0,
            32,
            10,
            10,
            11,
        );
        let config = InferenceConfig::from_metadata(&metadata);
        assert_eq!(config.label_index_for_path(Path::new("data/metal/metal3.png")), Some(2));
        assert_eq!(config.label_index_for_path(Path::new("data/unknown/a.png")), None);
        assert_eq!(config.label_index_for_path(Path::new("a.png")), None);
    }
}
