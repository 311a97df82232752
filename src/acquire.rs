//! データセットの取得と展開
//!
//! アーカイブをダウンロード（または手元のものを使い）、クラスごとの
//! ディレクトリが並ぶ階層まで展開する。展開済みなら何もしない。

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::external::run_tool;
use crate::model::{DatasetSettings, DatasetSource};

/// 展開先のディレクトリ名（download_dir 直下）
const EXTRACT_DIR: &str = "extracted";

/// アーカイブの形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

fn archive_kind(path: &Path) -> Option<ArchiveKind> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

/// アーカイブを展開
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let kind = archive_kind(archive)
        .ok_or_else(|| PipelineError::UnsupportedArchive(archive.to_path_buf()))?;
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive: {}", archive.display()))?;

    log::info!("展開中: {} -> {}", archive.display(), dest.display());
    match kind {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file)
                .with_context(|| format!("Failed to read zip archive: {}", archive.display()))?;
            zip.extract(dest)
                .with_context(|| format!("Failed to extract {}", archive.display()))?;
        }
        ArchiveKind::TarGz => {
            tar::Archive::new(GzDecoder::new(file))
                .unpack(dest)
                .with_context(|| format!("Failed to extract {}", archive.display()))?;
        }
        ArchiveKind::Tar => {
            tar::Archive::new(file)
                .unpack(dest)
                .with_context(|| format!("Failed to extract {}", archive.display()))?;
        }
    }
    Ok(())
}

/// URLからファイルをダウンロード
fn download(url: &str, download_dir: &Path) -> Result<PathBuf> {
    let file_name = url
        .split(['?', '#'])
        .next()
        .and_then(|u| u.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or("dataset.zip");
    let path = download_dir.join(file_name);
    if path.exists() {
        log::info!("ダウンロード済み: {}", path.display());
        return Ok(path);
    }

    log::info!("ダウンロード中: {}", url);
    std::fs::create_dir_all(download_dir)?;
    run_tool(
        "curl",
        [OsStr::new("-fL"), OsStr::new("-o"), path.as_os_str(), OsStr::new(url)],
    )?;
    Ok(path)
}

/// Kaggle CLI でデータセットをダウンロード
fn download_kaggle(dataset: &str, download_dir: &Path) -> Result<PathBuf> {
    let name = dataset.rsplit('/').next().unwrap_or(dataset);
    let path = download_dir.join(format!("{}.zip", name));
    if path.exists() {
        log::info!("ダウンロード済み: {}", path.display());
        return Ok(path);
    }

    log::info!("Kaggle からダウンロード中: {}", dataset);
    std::fs::create_dir_all(download_dir)?;
    run_tool(
        "kaggle",
        [
            OsStr::new("datasets"),
            OsStr::new("download"),
            OsStr::new("-d"),
            OsStr::new(dataset),
            OsStr::new("-p"),
            download_dir.as_os_str(),
        ],
    )?;
    if !path.exists() {
        return Err(PipelineError::MissingOutput(path).into());
    }
    Ok(path)
}

/// クラスディレクトリが並ぶルートを用意して返す
pub fn prepare_dataset(settings: &DatasetSettings) -> Result<PathBuf> {
    let download_dir = PathBuf::from(&settings.download_dir);
    let extract_dir = download_dir.join(EXTRACT_DIR);
    let root = match &settings.subdir {
        Some(subdir) => extract_dir.join(subdir),
        None => extract_dir.clone(),
    };

    let archive = match &settings.source {
        DatasetSource::Local { path } => {
            let local = PathBuf::from(path);
            if !local.is_dir() {
                anyhow::bail!("dataset directory not found: {}", local.display());
            }
            log::info!("ローカルのデータセットを使用: {}", local.display());
            return Ok(local);
        }
        _ if root.is_dir() => {
            log::info!("展開済みのデータセットを使用: {}", root.display());
            return Ok(root);
        }
        DatasetSource::Archive { path } => PathBuf::from(path),
        DatasetSource::Url { url } => download(url, &download_dir)?,
        DatasetSource::Kaggle { dataset } => download_kaggle(dataset, &download_dir)?,
    };
    unpack(&archive, &extract_dir)?;

    if !root.is_dir() {
        anyhow::bail!(
            "archive {} does not contain {}",
            archive.display(),
            root.display()
        );
    }
    Ok(root)
}
