#![recursion_limit = "256"]

use anyhow::Result;
use burn::backend::Autodiff;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::Parser;
use std::path::{Path, PathBuf};

use garbage_classifier_lib::ml::{load_classifier_bundle, InferenceEngine};
use garbage_classifier_lib::model::{load_metadata, print_metadata_info, AppConfig, DatasetSource, DeviceType};
use garbage_classifier_lib::pipeline::run_pipeline;
use garbage_classifier_lib::quant::lower_classifier;

#[derive(Debug, Clone, Parser)]
#[clap(name = "garbage-classifier", version, about = "ごみ画像分類器の学習と量子化")]
enum Opts {
    /// パイプライン全体を実行
    Run {
        /// 設定ファイル (JSON、既定は pipeline.json)
        #[clap(long)]
        config: Option<PathBuf>,
        /// クラスごとのディレクトリを含むデータセット（取得元の設定を上書き）
        #[clap(long)]
        data_dir: Option<PathBuf>,
        /// 出力ディレクトリ
        #[clap(long)]
        output_dir: Option<PathBuf>,
        /// 計算デバイス (wgpu / cpu)
        #[clap(long)]
        device: Option<DeviceType>,
        /// アクセラレータ向けコンパイルを省略
        #[clap(long)]
        skip_compile: bool,
    },
    /// 変換済みグラフ (.graph) またはモデルバンドル (.tar.gz) で画像を分類
    Classify {
        /// モデルファイル
        model: PathBuf,
        /// 画像ファイル
        #[clap(required = true)]
        images: Vec<PathBuf>,
        /// 計算デバイス (wgpu / cpu)
        #[clap(long, default_value = "cpu")]
        device: DeviceType,
    },
    /// デフォルト設定をファイルに書き出す
    InitConfig {
        /// 出力先（既定は pipeline.json）
        path: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(Opts::parse()) {
        eprintln!("エラー: {}", err);
        for cause in err.chain().skip(1) {
            eprintln!("  原因: {}", cause);
        }
        std::process::exit(1);
    }
}

fn run(opts: Opts) -> Result<()> {
    match opts {
        Opts::Run {
            config,
            data_dir,
            output_dir,
            device,
            skip_compile,
        } => {
            let config = config.unwrap_or_else(AppConfig::default_path);
            let mut app_config = AppConfig::load_or_default(&config)?;
            if let Some(data_dir) = data_dir {
                app_config.dataset.source = DatasetSource::Local {
                    path: data_dir.to_string_lossy().into_owned(),
                };
            }
            if let Some(output_dir) = output_dir {
                app_config.output.dir = output_dir.to_string_lossy().into_owned();
            }
            if let Some(device) = device {
                app_config.device_type = device;
            }
            train(&app_config, skip_compile)
        }
        Opts::Classify {
            model,
            images,
            device,
        } => match resolve_device(device) {
            #[cfg(feature = "wgpu")]
            DeviceType::Wgpu => {
                classify::<burn_wgpu::Wgpu>(&model, &images, &burn_wgpu::WgpuDevice::default())
            }
            _ => classify::<NdArray<f32>>(&model, &images, &NdArrayDevice::Cpu),
        },
        Opts::InitConfig { path } => {
            let path = path.unwrap_or_else(AppConfig::default_path);
            AppConfig::default().save(&path)?;
            log::info!("デフォルト設定を書き出しました: {}", path.display());
            Ok(())
        }
    }
}

/// ビルドに含まれていないバックエンドは CPU に置き換える
fn resolve_device(device: DeviceType) -> DeviceType {
    if device == DeviceType::Wgpu && !cfg!(feature = "wgpu") {
        log::warn!("WGPU バックエンドが無効なビルドのため CPU で実行します");
        return DeviceType::Cpu;
    }
    device
}

fn train(config: &AppConfig, skip_compile: bool) -> Result<()> {
    let device_type = resolve_device(config.device_type);
    log::info!("使用デバイス: {}", device_type);
    match device_type {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => train_on::<Autodiff<burn_wgpu::Wgpu>>(
            config,
            &burn_wgpu::WgpuDevice::default(),
            skip_compile,
        ),
        _ => train_on::<Autodiff<NdArray<f32>>>(config, &NdArrayDevice::Cpu, skip_compile),
    }
}

fn train_on<B: AutodiffBackend>(config: &AppConfig, device: &B::Device, skip_compile: bool) -> Result<()> {
    let outcome = run_pipeline::<B>(config, device, skip_compile)?;

    if let Some(last) = outcome.history.last() {
        log::info!("最終エポック: {}", last);
    }
    if let Some(report) = &outcome.verification {
        log::info!(
            "正解率 (フル精度 / 量子化): {:.4} / {:.4}",
            report.float_accuracy,
            report.quantized_accuracy
        );
    }
    match &outcome.compiled {
        Some(compiled) => log::info!("アクセラレータ用モデル: {}", compiled.binary.display()),
        None => log::info!("量子化モデル: {}", outcome.quantized_graph.display()),
    }
    Ok(())
}

fn classify<B: Backend>(model: &Path, images: &[PathBuf], device: &B::Device) -> Result<()> {
    let metadata = load_metadata(model)?;
    print_metadata_info(&metadata);

    let is_graph = model.extension().map_or(false, |ext| ext == "graph");
    let engine = if is_graph {
        InferenceEngine::<B>::load(model, device)?
    } else {
        let (classifier, metadata) = load_classifier_bundle::<B>(model, device)?;
        let graph = lower_classifier(&classifier, metadata.image_size as usize)?;
        InferenceEngine::from_graph(graph, &metadata, device)?
    };
    engine.config().print_info();

    let mut labeled = 0;
    let mut correct = 0;
    for (path, prediction) in images.iter().zip(engine.classify_batch(images)?) {
        let verdict = match engine.config().label_index_for_path(path) {
            Some(expected) => {
                labeled += 1;
                if expected == prediction.class_index {
                    correct += 1;
                    "ok"
                } else {
                    "ng"
                }
            }
            None => "-",
        };
        println!(
            "{}\t{}\t{:.4}\t{}",
            path.display(),
            prediction.label,
            prediction.confidence,
            verdict
        );
    }
    if labeled > 0 {
        log::info!(
            "正解率: {:.4} ({} / {}、ディレクトリ名がラベルの画像のみ)",
            correct as f64 / labeled as f64,
            correct,
            labeled
        );
    }
    Ok(())
}
