//! 学習から変換までのパイプライン
//!
//! データセット取得 -> 学習 (2フェーズ) -> 変換・量子化 -> 検証 -> コンパイル
//! の順に実行する。いずれかの工程が失敗した時点で中断する。

use anyhow::{Context, Result};
use burn::{
    data::dataset::Dataset,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::AutodiffBackend,
};
use std::path::{Path, PathBuf};

use crate::acquire::prepare_dataset;
use crate::compiler::{AcceleratorCompiler, CompiledModel};
use crate::ml::dataset::{batches_per_epoch, build_loader, load_representative, ImageBatcher, ImageFolder};
use crate::ml::inference::InferenceEngine;
use crate::ml::ml_model::{save_classifier_bundle, Classifier, ClassifierConfig, FreezePolicy};
use crate::ml::training::{load_checkpoint, restore_for_training, train_phase, PhaseSchedule, TrainingHistory};
use crate::model::{AppConfig, ModelMetadata};
use crate::plot::save_history_plot;
use crate::quant::{calibrate, lower_classifier, quantize_graph, save_graph, save_tflite, GraphExecutor};
use crate::verify::{compare_on_batch, VerificationReport};

/// 出力ディレクトリ内のファイル名
pub const LABELS_FILE: &str = "labels.txt";
pub const HEAD_PLOT_FILE: &str = "graph1.png";
pub const FINE_TUNE_PLOT_FILE: &str = "graph2.png";
pub const HEAD_HISTORY_FILE: &str = "history_head.csv";
pub const FINE_TUNE_HISTORY_FILE: &str = "history_fine_tune.csv";
pub const HEAD_CHECKPOINT_DIR: &str = "training_1";
pub const FINE_TUNE_CHECKPOINT_DIR: &str = "training_2";
pub const VERIFICATION_FILE: &str = "verification.json";

/// 実行結果
#[derive(Debug)]
pub struct PipelineOutcome {
    pub output_dir: PathBuf,
    pub class_labels: Vec<String>,
    pub history: TrainingHistory,
    pub float_graph: PathBuf,
    pub quantized_graph: PathBuf,
    /// アクセラレータ用コンパイラに渡す TFLite モデル
    pub quantized_tflite: PathBuf,
    /// 検証バッチが作れなかった場合は None
    pub verification: Option<VerificationReport>,
    /// コンパイルを省略した場合は None
    pub compiled: Option<CompiledModel>,
    /// 出力ディレクトリに書いた成果物（エクスポート対象）
    pub artifacts: Vec<PathBuf>,
}

fn init_model<B: AutodiffBackend>(config: &AppConfig, device: &B::Device) -> Result<Classifier<B>> {
    let classifier_config = ClassifierConfig::new(config.model.num_classes)
        .with_width_multiplier(config.model.width_multiplier)
        .with_head_filters(config.model.head_filters)
        .with_dropout(config.model.dropout);

    let model = match &config.model.pretrained_weights {
        Some(weights) => {
            log::info!("事前学習済みバックボーンを読み込みます: {}", weights);
            classifier_config.init_pretrained::<B>(Path::new(weights), device)?
        }
        None => {
            log::warn!("事前学習済み重みが未設定のため、バックボーンをランダム初期化します");
            classifier_config.init::<B>(device)
        }
    };

    match &config.training.resume_checkpoint {
        Some(checkpoint) => load_checkpoint(model, Path::new(checkpoint), device),
        None => Ok(model),
    }
}

fn export_artifacts(artifacts: &[PathBuf], export_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(export_dir)
        .with_context(|| format!("Failed to create export dir: {}", export_dir.display()))?;
    for artifact in artifacts {
        let Some(name) = artifact.file_name() else {
            continue;
        };
        let target = export_dir.join(name);
        std::fs::copy(artifact, &target).with_context(|| {
            format!("Failed to copy {} to {}", artifact.display(), target.display())
        })?;
    }
    log::info!("成果物を {} にコピーしました ({} 件)", export_dir.display(), artifacts.len());
    Ok(())
}

/// パイプライン全体を実行
///
/// `skip_compile` が真、または設定でコンパイラが無効な場合は
/// アクセラレータ向けのコンパイルを行わない。
pub fn run_pipeline<B: AutodiffBackend>(
    config: &AppConfig,
    device: &B::Device,
    skip_compile: bool,
) -> Result<PipelineOutcome> {
    config.validate()?;
    config.display();

    let compiler = if config.compiler.enabled && !skip_compile {
        let compiler = AcceleratorCompiler::new(config.compiler.clone());
        compiler.preflight()?;
        Some(compiler)
    } else {
        log::info!("コンパイル工程は実行しません");
        None
    };

    // データセット
    let data_root = prepare_dataset(&config.dataset)?;
    let output_dir = config.output_dir();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output dir: {}", output_dir.display()))?;
    let mut artifacts = Vec::new();

    let folder = ImageFolder::scan(&data_root)?;
    folder.ensure_class_count(config.model.num_classes)?;
    let labels_path = config.artifact_path(LABELS_FILE);
    folder.write_labels(&labels_path)?;
    artifacts.push(labels_path);
    log::info!(
        "データセット: {} 枚, クラス: {}",
        folder.len(),
        folder.class_names().join(", ")
    );

    let image_size = config.dataset.image_size;
    let num_classes = folder.num_classes();
    let batch_size = config.training.batch_size;
    let (train_set, valid_set) = folder.split(config.dataset.validation_split)?;
    log::info!(
        "学習 {} 枚 ({} バッチ), 検証 {} 枚 ({} バッチ)",
        train_set.len(),
        batches_per_epoch(train_set.len(), batch_size),
        valid_set.len(),
        batches_per_epoch(valid_set.len(), batch_size)
    );
    let representative = train_set.sample_paths(
        config.quantization.representative_samples,
        config.quantization.seed,
    );

    let train_loader = build_loader::<B>(
        train_set,
        ImageBatcher::new(device.clone(), image_size, num_classes),
        batch_size,
        Some(config.training.seed),
    );
    let valid_loader = build_loader::<B::InnerBackend>(
        valid_set,
        ImageBatcher::new(device.clone(), image_size, num_classes),
        batch_size,
        None,
    );

    // フェーズ1: ヘッドのみ
    let initial = init_model::<B>(config, device)?;
    let (trained, head_history) = train_phase(
        initial.clone(),
        train_loader.clone(),
        valid_loader.clone(),
        &PhaseSchedule {
            name: "head".to_string(),
            num_epochs: config.training.head.num_epochs,
            learning_rate: config.training.head.learning_rate,
        },
        &config.artifact_path(HEAD_CHECKPOINT_DIR),
        device,
    )?;
    let path = config.artifact_path(HEAD_HISTORY_FILE);
    head_history.save_csv(&path)?;
    artifacts.push(path);
    let path = config.artifact_path(HEAD_PLOT_FILE);
    save_history_plot(&head_history, &path)?;
    artifacts.push(path);

    // フェーズ2: バックボーン後半も学習
    let fine_tune = &config.training.fine_tune;
    let model = restore_for_training(initial, trained, device)?
        .with_freeze(FreezePolicy::From(fine_tune.fine_tune_at));
    let (model, fine_tune_history) = train_phase(
        model,
        train_loader,
        valid_loader.clone(),
        &PhaseSchedule {
            name: "fine_tune".to_string(),
            num_epochs: fine_tune.num_epochs,
            learning_rate: fine_tune.learning_rate,
        },
        &config.artifact_path(FINE_TUNE_CHECKPOINT_DIR),
        device,
    )?;
    let path = config.artifact_path(FINE_TUNE_HISTORY_FILE);
    fine_tune_history.save_csv(&path)?;
    artifacts.push(path);
    let path = config.artifact_path(FINE_TUNE_PLOT_FILE);
    save_history_plot(&fine_tune_history, &path)?;
    artifacts.push(path);

    // フル精度モデルの保存
    let name = &config.output.model_name;
    let metadata = ModelMetadata::new(
        folder.class_names().to_vec(),
        image_size as u32,
        config.model.width_multiplier,
        config.model.head_filters,
        config.training.head.num_epochs as u32,
        fine_tune.num_epochs as u32,
        fine_tune.fine_tune_at,
    );

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let weights_path = config.artifact_path(name);
    model
        .clone()
        .save_file(weights_path.clone(), &recorder)
        .map_err(|e| anyhow::anyhow!("モデル重みの保存エラー: {:?}", e))?;
    artifacts.push(weights_path.with_extension("mpk"));
    let bundle_path = config.artifact_path(&format!("{}.tar.gz", name));
    save_classifier_bundle(&bundle_path, &model, &metadata.clone().stamped())?;
    artifacts.push(bundle_path);

    // 変換と量子化
    let graph = lower_classifier(&model, image_size)?;
    let float_graph = config.artifact_path(&format!("{}.graph", name));
    save_graph(&float_graph, &graph, &metadata)?;
    artifacts.push(float_graph.clone());

    log::info!("代表データ {} 枚で量子化範囲を測定します", representative.len());
    let samples = load_representative(&representative, image_size)?;
    let executor = GraphExecutor::<B::InnerBackend>::new(graph.clone(), device)?;
    let ranges = calibrate(&executor, &samples)?;
    let quantized = quantize_graph(&graph, &ranges)?;
    let quantized_graph = config.artifact_path(&format!("{}_quant.graph", name));
    save_graph(&quantized_graph, &quantized, &metadata)?;
    artifacts.push(quantized_graph.clone());
    let quantized_tflite = config.artifact_path(&format!("{}_quant.tflite", name));
    save_tflite(&quantized_tflite, &quantized)?;
    artifacts.push(quantized_tflite.clone());

    // 検証
    let verification = match valid_loader.iter().next() {
        Some(batch) => {
            let engine = InferenceEngine::from_graph(quantized, &metadata, device)?;
            let report = compare_on_batch(&model, &engine, batch)?;
            report.print();
            let path = config.artifact_path(VERIFICATION_FILE);
            report.save(&path)?;
            artifacts.push(path);
            Some(report)
        }
        None => {
            log::warn!("検証データが空のため、量子化の検証を省略します");
            None
        }
    };

    // コンパイル
    let compiled = match compiler {
        Some(compiler) => {
            let compiled = compiler.compile(&quantized_tflite, &output_dir)?;
            artifacts.push(compiled.binary.clone());
            artifacts.push(compiled.log.clone());
            Some(compiled)
        }
        None => None,
    };

    if let Some(export_dir) = &config.output.export_dir {
        export_artifacts(&artifacts, Path::new(export_dir))?;
    }

    log::info!("パイプライン完了: {}", output_dir.display());
    Ok(PipelineOutcome {
        output_dir,
        class_labels: folder.class_names().to_vec(),
        history: head_history.chain(&fine_tune_history),
        float_graph,
        quantized_graph,
        quantized_tflite,
        verification,
        compiled,
        artifacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::training::CHECKPOINT_DIR;
    use crate::model::{DatasetSource, FineTuneSettings, PhaseSettings};
    use crate::test_util::{scratch_dir, write_image_folder};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.dataset.source = DatasetSource::Local {
            path: dir.join("data").to_string_lossy().into_owned(),
        };
        config.dataset.download_dir = dir.join("download").to_string_lossy().into_owned();
        config.dataset.image_size = 96;
        config.dataset.validation_split = 0.25;
        config.model.num_classes = 3;
        config.model.width_multiplier = 0.35;
        config.model.head_filters = 4;
        config.training.batch_size = 4;
        config.training.head = PhaseSettings {
            num_epochs: 1,
            learning_rate: 1e-3,
        };
        config.training.fine_tune = FineTuneSettings {
            num_epochs: 1,
            learning_rate: 1e-5,
            fine_tune_at: 17,
        };
        config.quantization.representative_samples = 4;
        config.compiler.enabled = false;
        config.output.dir = dir.join("output").to_string_lossy().into_owned();
        config.output.model_name = "tiny".to_string();
        config.output.export_dir = Some(dir.join("export").to_string_lossy().into_owned());
        config
    }

    #[test]
    fn test_pipeline_writes_all_artifacts() {
        let dir = scratch_dir("pipeline_end_to_end");
        write_image_folder(&dir.join("data"), &[("glass", 4), ("metal", 4), ("paper", 4)], 24);
        let config = tiny_config(&dir);

        let outcome = run_pipeline::<TestBackend>(&config, &Default::default(), false).unwrap();

        assert_eq!(outcome.class_labels, vec!["glass", "metal", "paper"]);
        assert_eq!(outcome.history.len(), 2);
        assert!(outcome.compiled.is_none());
        let report = outcome.verification.unwrap();
        assert_eq!(report.batch_size, 3);

        let labels = std::fs::read_to_string(dir.join("output").join(LABELS_FILE)).unwrap();
        assert_eq!(labels, "glass\nmetal\npaper\n");
        for name in [
            HEAD_PLOT_FILE,
            FINE_TUNE_PLOT_FILE,
            HEAD_HISTORY_FILE,
            FINE_TUNE_HISTORY_FILE,
            VERIFICATION_FILE,
            "tiny.mpk",
            "tiny.tar.gz",
            "tiny.graph",
            "tiny_quant.graph",
            "tiny_quant.tflite",
        ] {
            assert!(dir.join("output").join(name).exists(), "missing {}", name);
            assert!(dir.join("export").join(name).exists(), "not exported {}", name);
        }
        for phase in [HEAD_CHECKPOINT_DIR, FINE_TUNE_CHECKPOINT_DIR] {
            let checkpoint = dir.join("output").join(phase).join(CHECKPOINT_DIR).join("model-1.mpk");
            assert!(checkpoint.exists(), "missing {}", checkpoint.display());
        }
        let tflite = std::fs::read(&outcome.quantized_tflite).unwrap();
        assert!(flatbuffers::buffer_has_identifier(&tflite, "TFL3", false));

        let engine = InferenceEngine::<NdArray<f32>>::load(&outcome.quantized_graph, &Default::default()).unwrap();
        assert!(engine.is_quantized());
        let prediction = engine
            .classify_image(dir.join("data").join("metal").join("metal3.png"))
            .unwrap();
        assert!(outcome.class_labels.contains(&prediction.label));
    }

    #[test]
    fn test_class_count_mismatch_fails_before_training() {
        let dir = scratch_dir("pipeline_class_mismatch");
        write_image_folder(&dir.join("data"), &[("glass", 2), ("metal", 2)], 8);
        let config = tiny_config(&dir);

        let err = run_pipeline::<TestBackend>(&config, &Default::default(), true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::PipelineError>(),
            Some(crate::error::PipelineError::ClassCountMismatch { expected: 3, found: 2 })
        ));
        assert!(!dir.join("output").join(HEAD_CHECKPOINT_DIR).exists());
    }
}
