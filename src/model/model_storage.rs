//! 成果物の永続化
//!
//! Tar.gz形式で複数のファイルを1つのバンドルに統合して保存・読み込みします。
//!
//! フル精度モデルのバンドル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル、入力サイズなど）
//! - model.bin       - モデルの重み（burn のバイナリレコード）
//!
//! ヘッダの時刻は常に0で書き込むため、同じ入力からは同じバイト列が得られます。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const MODEL_ENTRY: &str = "model.bin";

/// 名前付きエントリをtar.gzバンドルとして書き込む
pub fn write_bundle(output_path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let file = File::create(output_path)
        .context(format!("Failed to create bundle file: {:?}", output_path))?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    for (name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(name)?;
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        tar_builder
            .append(&header, *bytes)
            .context(format!("Failed to add {} to bundle", name))?;
    }

    // tarアーカイブを完成させ、gzipストリームを閉じる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")?;

    Ok(())
}

/// tar.gzバンドルの全エントリを読み込む
pub fn read_bundle(bundle_path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let file = File::open(bundle_path)
        .context(format!("Failed to open bundle file: {:?}", bundle_path))?;

    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);
    let mut entries = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer)?;
        entries.insert(name, buffer);
    }

    Ok(entries)
}

/// バンドルから指定エントリを取り出す
pub fn take_entry(
    entries: &mut BTreeMap<String, Vec<u8>>,
    name: &str,
    bundle_path: &Path,
) -> Result<Vec<u8>> {
    entries
        .remove(name)
        .ok_or_else(|| anyhow::anyhow!("{} not found in bundle {:?}", name, bundle_path))
}

/// メタデータと共にモデルをTar.gz形式で保存
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    let json_str = metadata.to_json_string()?;
    write_bundle(
        output_path,
        &[
            (METADATA_ENTRY, json_str.as_bytes()),
            (MODEL_ENTRY, model_binary),
        ],
    )
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(bundle_path: &Path) -> Result<ModelMetadata> {
    let mut entries = read_bundle(bundle_path)?;
    let json = take_entry(&mut entries, METADATA_ENTRY, bundle_path)?;
    let json = String::from_utf8(json).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(bundle_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut entries = read_bundle(bundle_path)?;
    let json = take_entry(&mut entries, METADATA_ENTRY, bundle_path)?;
    let json = String::from_utf8(json).context("metadata.json is not valid UTF-8")?;
    let metadata = ModelMetadata::from_json_string(&json)?;
    let binary = take_entry(&mut entries, MODEL_ENTRY, bundle_path)?;
    Ok((metadata, binary))
}

/// メタデータをログに出力
pub fn print_metadata_info(metadata: &ModelMetadata) {
    log::info!("=== モデルメタデータ ===");
    log::info!("クラスラベル: {}", metadata.class_labels.join(", "));
    log::info!(
        "モデル入力サイズ: {}x{}",
        metadata.image_size,
        metadata.image_size
    );
    log::info!("幅係数: {}", metadata.width_multiplier);
    log::info!(
        "学習エポック数: ヘッド {} / ファインチューニング {} (fine_tune_at {})",
        metadata.head_epochs,
        metadata.fine_tune_epochs,
        metadata.fine_tune_at
    );
    if let Some(trained_at) = &metadata.trained_at {
        log::info!("学習日時: {}", trained_at);
    }
}
