//! モデル学習
//!
//! エポックごとに「学習 → 検証」の2フェーズを回します。乱数生成器・オプティマイザ・
//! 完了エポック数などの状態は `TrainingState` にまとめ、各ステップに明示的に渡します。
//! 学習が最後まで完了した時点でのみチェックポイントを書き出します。

use std::fmt;
use std::path::PathBuf;

use burn::{
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
    train::ClassificationOutput,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ml::batcher::{BatchLoader, BatchSampler, GestureBatcher};
use crate::ml::classifier::{argmax_rows, Classifier, ClassifierConfig};
use crate::ml::dataset::GestureDataset;
use crate::ml::preprocess::ImageTransform;
use crate::model::config::{ModelSettings, TrainingSettings};
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::{load_model_with_metadata, save_model_with_metadata};

/// 学習フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Train,
    Valid,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Train => "training",
            Phase::Valid => "validation",
        }
    }
}

/// バッチ単位の損失ログ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub epoch: usize,
    pub phase: Phase,
    pub batch_index: usize,
    pub batch_size: usize,
    /// バッチ内平均の損失
    pub loss: f64,
}

/// フェーズ内の損失・正解数の累積
///
/// バッチ平均損失 × バッチサイズを足し込み、最後にサンプル総数で割ります。
#[derive(Debug, Clone, Default)]
pub struct LossAccumulator {
    total_loss: f64,
    correct: usize,
    samples: usize,
    batches: usize,
}

impl LossAccumulator {
    pub fn add(&mut self, mean_loss: f64, batch_size: usize, correct: usize) {
        self.total_loss += mean_loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size;
        self.batches += 1;
    }

    pub fn mean_loss(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_loss / self.samples as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn batches(&self) -> usize {
        self.batches
    }
}

/// エポックの集計結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub train_samples: usize,
    pub train_batches: usize,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
}

impl fmt::Display for EpochSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {}: train loss {:.4} (acc {:.1}%)",
            self.epoch,
            self.train_loss,
            self.train_accuracy * 100.0
        )?;
        if let (Some(loss), Some(acc)) = (self.val_loss, self.val_accuracy) {
            write!(f, ", val loss {:.4} (acc {:.1}%)", loss, acc * 100.0)?;
        }
        Ok(())
    }
}

/// 学習状態
pub struct TrainingState<B: AutodiffBackend, O> {
    pub optimizer: O,
    pub device: B::Device,
    pub learning_rate: f64,
    /// 完了したエポック数
    pub epoch: usize,
    pub rng: StdRng,
    pub history: Vec<EpochSummary>,
    pub batch_log: Vec<BatchRecord>,
}

impl<B, O> TrainingState<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B>,
{
    pub fn new(optimizer: O, device: B::Device, learning_rate: f64, seed: u64) -> Self {
        Self {
            optimizer,
            device,
            learning_rate,
            epoch: 0,
            rng: StdRng::seed_from_u64(seed),
            history: Vec::new(),
            batch_log: Vec::new(),
        }
    }
}

/// 学習ループの設定
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub num_epochs: usize,
    pub batch_size: usize,
    pub num_workers: usize,
}

/// Adam（β1=0.9, β2=0.999, ε=1e-8）
pub fn adam<B: AutodiffBackend>() -> impl Optimizer<Classifier<B>, B> {
    AdamConfig::new().with_epsilon(1e-8).init()
}

/// 再開時の乱数シード
///
/// 完了エポック数を混ぜ、再開直後のエポックが1エポック目と同じ順序にならないようにします。
/// 新規学習（完了0）では `seed` そのまま。
pub fn epoch_seed(seed: u64, epochs_completed: usize) -> u64 {
    seed ^ (epochs_completed as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// 損失が有限値であることを確認
pub fn ensure_finite(phase: Phase, epoch: usize, batch: usize, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::NumericInstability {
            phase: phase.as_str(),
            epoch,
            batch,
            value,
        })
    }
}

/// モデルの全パラメータが指定デバイス上にあることを確認
pub fn check_device<B: Backend>(model: &Classifier<B>, device: &B::Device) -> Result<()> {
    match model.devices().into_iter().find(|found| found != device) {
        Some(found) => Err(Error::DeviceMismatch {
            expected: format!("{device:?}"),
            found: format!("{found:?}"),
        }),
        None => Ok(()),
    }
}

/// バッチ内の正解数
fn count_correct<B: Backend>(output: &ClassificationOutput<B>) -> Result<usize> {
    let [_, num_classes] = output.output.dims();
    let logits = output
        .output
        .clone()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Record(format!("{e:?}")))?;
    let targets = output
        .targets
        .clone()
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| Error::Record(format!("{e:?}")))?;

    Ok(argmax_rows(&logits, num_classes)
        .into_iter()
        .zip(targets)
        .filter(|(predicted, target)| *predicted as i64 == *target)
        .count())
}

/// 学習フェーズ（1エポック）
///
/// サンプル順はエポックごとに `state.rng` でシャッフルされます。
pub fn run_training_phase<B, O>(
    mut model: Classifier<B>,
    state: &mut TrainingState<B, O>,
    dataset: &GestureDataset,
    loader: &BatchLoader,
    batch_size: usize,
) -> Result<(Classifier<B>, LossAccumulator)>
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B>,
{
    let batcher = GestureBatcher::<B>::new(state.device.clone(), dataset.transform());
    let sampler = BatchSampler::new(dataset.size(), batch_size, true);
    let mut accumulator = LossAccumulator::default();

    for (batch_index, indices) in sampler.batches(&mut state.rng).into_iter().enumerate() {
        let batch = batcher.checked_batch(loader.load(dataset, &indices)?)?;
        let batch_size = batch.batch_size();

        let output = model.forward_classification(batch.images, batch.targets)?;
        let loss = output.loss.clone().into_scalar().elem::<f64>();
        let loss = ensure_finite(Phase::Train, state.epoch, batch_index, loss)?;
        let correct = count_correct(&output)?;

        // 逆伝播とパラメータ更新
        let grads = GradientsParams::from_grads(output.loss.backward(), &model);
        model = state.optimizer.step(state.learning_rate, model, grads);

        accumulator.add(loss, batch_size, correct);
        state.batch_log.push(BatchRecord {
            epoch: state.epoch,
            phase: Phase::Train,
            batch_index,
            batch_size,
            loss,
        });
        debug!(epoch = state.epoch, batch = batch_index, batch_size, loss, "学習バッチ");
    }

    Ok((model, accumulator))
}

/// 検証フェーズ（勾配なし、パラメータは変更しない）
pub fn run_validation_phase<B: Backend>(
    model: &Classifier<B>,
    dataset: &GestureDataset,
    loader: &BatchLoader,
    batch_size: usize,
    device: &B::Device,
    epoch: usize,
    batch_log: &mut Vec<BatchRecord>,
) -> Result<LossAccumulator> {
    let batcher = GestureBatcher::<B>::new(device.clone(), dataset.transform());
    let sampler = BatchSampler::new(dataset.size(), batch_size, false);
    let mut accumulator = LossAccumulator::default();
    let mut unused_rng = StdRng::seed_from_u64(0);

    for (batch_index, indices) in sampler.batches(&mut unused_rng).into_iter().enumerate() {
        let batch = batcher.checked_batch(loader.load(dataset, &indices)?)?;
        let batch_size = batch.batch_size();

        let output = model.forward_classification(batch.images, batch.targets)?;
        let loss = output.loss.clone().into_scalar().elem::<f64>();
        let loss = ensure_finite(Phase::Valid, epoch, batch_index, loss)?;

        accumulator.add(loss, batch_size, count_correct(&output)?);
        batch_log.push(BatchRecord {
            epoch,
            phase: Phase::Valid,
            batch_index,
            batch_size,
            loss,
        });
    }

    Ok(accumulator)
}

/// 学習ループ
///
/// `on_epoch` は各エポックの検証後に呼ばれます。
pub fn fit<B, O, F>(
    mut model: Classifier<B>,
    state: &mut TrainingState<B, O>,
    train: &GestureDataset,
    valid: Option<&GestureDataset>,
    options: &FitOptions,
    mut on_epoch: F,
) -> Result<Classifier<B>>
where
    B: AutodiffBackend,
    O: Optimizer<Classifier<B>, B>,
    F: FnMut(&EpochSummary),
{
    if let Some(valid) = valid {
        if valid.classes() != train.classes() {
            return Err(Error::Data(format!(
                "validation classes in {} differ from training classes in {}",
                valid.root().display(),
                train.root().display()
            )));
        }
        if valid.transform() != train.transform() {
            return Err(Error::ShapeMismatch {
                stage: "validation transform",
                expected: train.transform().shape().to_vec(),
                actual: valid.transform().shape().to_vec(),
            });
        }
    }
    check_device(&model, &state.device)?;

    let loader = BatchLoader::new(options.num_workers)?;

    for _ in 0..options.num_epochs {
        state.epoch += 1;

        let (trained, train_acc) =
            run_training_phase(model, state, train, &loader, options.batch_size)?;
        model = trained;

        let valid_acc = match valid {
            Some(dataset) => Some(run_validation_phase(
                &model.valid(),
                dataset,
                &loader,
                options.batch_size,
                &state.device,
                state.epoch,
                &mut state.batch_log,
            )?),
            None => None,
        };

        let summary = EpochSummary {
            epoch: state.epoch,
            train_loss: train_acc.mean_loss(),
            train_accuracy: train_acc.accuracy(),
            train_samples: train_acc.samples(),
            train_batches: train_acc.batches(),
            val_loss: valid_acc.as_ref().map(LossAccumulator::mean_loss),
            val_accuracy: valid_acc.as_ref().map(LossAccumulator::accuracy),
        };
        info!(
            epoch = summary.epoch,
            train_loss = summary.train_loss,
            train_accuracy = summary.train_accuracy,
            val_loss = ?summary.val_loss,
            val_accuracy = ?summary.val_accuracy,
            "エポック完了"
        );
        on_epoch(&summary);
        state.history.push(summary);
    }

    Ok(model)
}

/// 学習結果
#[derive(Debug)]
pub struct TrainingReport {
    /// 書き出したチェックポイント
    pub checkpoint: PathBuf,
    pub metadata: ModelMetadata,
    pub batch_log: Vec<BatchRecord>,
}

/// 設定に従って学習を実行し、チェックポイントを書き出す
///
/// `checkpoint_in` がある場合はモデル・オプティマイザ・完了エポック数を復元し、
/// 保存済みのラベル空間と入力解像度をそのまま使います。
pub fn run_training<B, F>(
    training: &TrainingSettings,
    model_settings: &ModelSettings,
    device: B::Device,
    on_epoch: F,
) -> Result<TrainingReport>
where
    B: AutodiffBackend,
    F: FnMut(&EpochSummary),
{
    training.validate()?;

    let resume = training
        .checkpoint_in
        .as_deref()
        .map(load_model_with_metadata)
        .transpose()?;

    let train_set = match &resume {
        Some(stored) => {
            let transform = stored.metadata.transform();
            if transform != ImageTransform::new(training.image_width, training.image_height) {
                warn!(
                    width = transform.width,
                    height = transform.height,
                    "チェックポイントの入力解像度を使用します"
                );
            }
            GestureDataset::from_directory_with_labels(
                &training.data_dir,
                stored.metadata.labels.clone(),
                transform,
            )?
        }
        None => GestureDataset::from_directory(
            &training.data_dir,
            ImageTransform::new(training.image_width, training.image_height),
        )?,
    };

    let valid_set = training
        .val_dir
        .as_deref()
        .map(|dir| {
            GestureDataset::from_directory_with_labels(
                dir,
                train_set.classes().clone(),
                train_set.transform(),
            )
        })
        .transpose()?;
    if valid_set.is_none() {
        warn!("検証データが指定されていません。検証フェーズを省略します");
    }

    let mut optimizer = adam::<B>();
    let recorder = NamedMpkBytesRecorder::<FullPrecisionSettings>::default();

    let (config, mut model, epochs_completed, history) = match resume {
        Some(stored) => {
            let config = stored.metadata.classifier.clone();
            let model = config.load_bytes::<B>(stored.model, &device)?;
            if let Some(bytes) = stored.optimizer {
                let record = Recorder::<B>::load(&recorder, bytes, &device)
                    .map_err(|e| Error::LoadMismatch(format!("optimizer state: {e:?}")))?;
                optimizer = optimizer.load_record(record);
            } else {
                warn!("オプティマイザの状態がありません。初期状態から再開します");
            }
            info!(
                checkpoint = ?training.checkpoint_in,
                epochs_completed = stored.metadata.epochs_completed,
                "チェックポイントから再開します"
            );
            (
                config,
                model,
                stored.metadata.epochs_completed,
                stored.metadata.history,
            )
        }
        None => {
            let config = ClassifierConfig::new(train_set.num_classes())
                .with_image_width(training.image_width)
                .with_image_height(training.image_height)
                .with_backbone(model_settings.backbone.clone())
                .with_dropout(model_settings.dropout);
            config.validate()?;

            let model = match &model_settings.pretrained_backbone {
                Some(path) => {
                    info!(path = %path.display(), "事前学習済みバックボーンを読み込みます");
                    let backbone = config.backbone.init_pretrained::<B>(path, &device)?;
                    config.init_with_backbone(backbone, &device)
                }
                None => config.init::<B>(&device),
            };
            (config, model, 0, Vec::new())
        }
    };

    if model_settings.freeze_backbone {
        info!("バックボーンを固定してヘッドのみ学習します");
        model = model.freeze_backbone();
    }

    info!(
        classes = train_set.num_classes(),
        train_samples = train_set.size(),
        val_samples = valid_set.as_ref().map(GestureDataset::size),
        params = model.num_params(),
        "学習を開始します"
    );

    let mut state = TrainingState::<B, _>::new(
        optimizer,
        device,
        training.learning_rate,
        epoch_seed(training.seed, epochs_completed),
    );
    state.epoch = epochs_completed;
    state.history = history;

    let options = FitOptions {
        num_epochs: training.num_epochs,
        batch_size: training.batch_size,
        num_workers: training.num_workers,
    };
    let model = fit(model, &mut state, &train_set, valid_set.as_ref(), &options, on_epoch)?;

    // 学習が最後まで完了した場合のみ書き出す
    let model_bytes = model.to_bytes()?;
    let optimizer_bytes = Recorder::<B>::record(&recorder, state.optimizer.to_record(), ())
        .map_err(|e| Error::Record(format!("{e:?}")))?;
    let metadata = ModelMetadata::new(
        train_set.classes().clone(),
        config,
        state.epoch,
        state.history.clone(),
    );
    let checkpoint = save_model_with_metadata(
        &training.checkpoint_out,
        &metadata,
        &model_bytes,
        Some(&optimizer_bytes),
    )?;

    info!(path = %checkpoint.display(), epochs = state.epoch, "チェックポイントを保存しました");

    Ok(TrainingReport {
        checkpoint,
        metadata,
        batch_log: state.batch_log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::BackboneConfig;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn write_class(root: &Path, class: &str, count: usize, color: [u8; 3]) {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let mut pixel = color;
            pixel[0] = pixel[0].wrapping_add(i as u8 * 3);
            RgbImage::from_pixel(20, 20, Rgb(pixel))
                .save(dir.join(format!("{i:02}.png")))
                .unwrap();
        }
    }

    fn tiny_config(num_classes: usize) -> ClassifierConfig {
        ClassifierConfig::new(num_classes)
            .with_image_width(16)
            .with_image_height(16)
            .with_backbone(tiny_backbone())
    }

    fn tiny_backbone() -> BackboneConfig {
        BackboneConfig::new()
            .with_stem_channels(4)
            .with_stage_channels(vec![8])
            .with_stage_strides(vec![2])
            .with_embedding_dim(8)
    }

    fn settings(root: &Path, epochs: usize) -> (TrainingSettings, ModelSettings) {
        let training = TrainingSettings {
            data_dir: root.join("train"),
            val_dir: Some(root.join("val")),
            num_epochs: epochs,
            batch_size: 4,
            num_workers: 2,
            learning_rate: 1e-3,
            seed: 7,
            image_width: 16,
            image_height: 16,
            checkpoint_in: None,
            checkpoint_out: root.join("out").join("ckpt.tar.gz"),
        };
        let model = ModelSettings {
            backbone: tiny_backbone(),
            ..ModelSettings::default()
        };
        (training, model)
    }

    #[test]
    fn test_accumulator_weighted_average() {
        let mut acc = LossAccumulator::default();
        acc.add(1.0, 4, 2);
        acc.add(2.0, 4, 4);
        acc.add(4.0, 2, 0);

        assert!((acc.mean_loss() - 2.0).abs() < 1e-12);
        assert!((acc.accuracy() - 0.6).abs() < 1e-12);
        assert_eq!(acc.samples(), 10);
        assert_eq!(acc.batches(), 3);
        assert_eq!(LossAccumulator::default().mean_loss(), 0.0);
    }

    #[test]
    fn test_non_finite_loss_is_fatal() {
        assert!(ensure_finite(Phase::Train, 1, 0, 0.5).is_ok());
        assert!(matches!(
            ensure_finite(Phase::Train, 2, 3, f64::NAN),
            Err(Error::NumericInstability { epoch: 2, batch: 3, .. })
        ));
        assert!(ensure_finite(Phase::Valid, 1, 0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_one_epoch_two_classes_ten_images() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "A", 10, [200, 20, 20]);
        write_class(tmp.path(), "B", 10, [20, 20, 200]);

        let device = Default::default();
        let dataset = GestureDataset::from_directory(tmp.path(), ImageTransform::new(16, 16)).unwrap();
        let model = tiny_config(2).init::<TestBackend>(&device);
        let mut state = TrainingState::<TestBackend, _>::new(adam::<TestBackend>(), device, 1e-3, 42);
        let options = FitOptions {
            num_epochs: 1,
            batch_size: 4,
            num_workers: 0,
        };

        let mut summaries = Vec::new();
        fit(model, &mut state, &dataset, None, &options, |s| summaries.push(s.clone())).unwrap();

        assert_eq!(summaries.len(), 1);
        let summary = &state.history[0];
        assert_eq!(summary.train_samples, 20);
        assert_eq!(summary.train_batches, 5);
        assert!(summary.train_loss.is_finite());
        assert_eq!(summary.val_loss, None);

        // エポック損失 = バッチ損失のバッチサイズ加重平均
        let train_log: Vec<&BatchRecord> = state
            .batch_log
            .iter()
            .filter(|r| r.phase == Phase::Train)
            .collect();
        assert_eq!(train_log.len(), 5);
        assert!(train_log.iter().all(|r| r.batch_size == 4));
        let weighted: f64 = train_log.iter().map(|r| r.loss * r.batch_size as f64).sum();
        let total: usize = train_log.iter().map(|r| r.batch_size).sum();
        assert!((summary.train_loss - weighted / total as f64).abs() < 1e-9);
    }

    #[test]
    fn test_uneven_last_batch_is_weighted_by_size() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "A", 6, [200, 20, 20]);
        write_class(tmp.path(), "B", 5, [20, 20, 200]);

        let device = Default::default();
        let dataset = GestureDataset::from_directory(tmp.path(), ImageTransform::new(16, 16)).unwrap();
        let model = tiny_config(2).init::<TestBackend>(&device);
        let mut state = TrainingState::<TestBackend, _>::new(adam::<TestBackend>(), device, 1e-3, 3);
        let options = FitOptions {
            num_epochs: 1,
            batch_size: 4,
            num_workers: 2,
        };
        fit(model, &mut state, &dataset, None, &options, |_| {}).unwrap();

        let summary = &state.history[0];
        let sizes: Vec<usize> = state.batch_log.iter().map(|r| r.batch_size).collect();
        assert_eq!(sizes, vec![4, 4, 3]);
        assert_eq!(summary.train_samples, 11);

        let weighted: f64 = state.batch_log.iter().map(|r| r.loss * r.batch_size as f64).sum::<f64>() / 11.0;
        assert!((summary.train_loss - weighted).abs() < 1e-9);

        // 単純平均とは一致しない
        let plain: f64 = state.batch_log.iter().map(|r| r.loss).sum::<f64>() / 3.0;
        let last = state.batch_log[2].loss;
        let others = (state.batch_log[0].loss + state.batch_log[1].loss) / 2.0;
        if (last - others).abs() > 1e-6 {
            assert!((summary.train_loss - plain).abs() > 1e-9);
        }
    }

    #[test]
    fn test_diverging_training_writes_no_checkpoint() {
        let tmp = TempDir::new().unwrap();
        for split in ["train", "val"] {
            write_class(&tmp.path().join(split), "A", 6, [200, 20, 20]);
            write_class(&tmp.path().join(split), "B", 5, [20, 200, 20]);
        }
        let (mut training, model_settings) = settings(tmp.path(), 2);
        training.learning_rate = 1e30;

        let err = run_training::<TestBackend, _>(&training, &model_settings, Default::default(), |_| {});
        assert!(matches!(err, Err(Error::NumericInstability { .. })));
        assert!(!training.checkpoint_out.exists());
    }

    #[test]
    fn test_resumed_epoch_uses_new_shuffle_order() {
        assert_eq!(epoch_seed(7, 0), 7);
        assert_ne!(epoch_seed(7, 1), 7);

        let sampler = BatchSampler::new(11, 4, true);
        let first = sampler.batches(&mut StdRng::seed_from_u64(epoch_seed(7, 0)));
        let resumed = sampler.batches(&mut StdRng::seed_from_u64(epoch_seed(7, 1)));
        assert_ne!(first, resumed);
    }

    #[test]
    fn test_run_training_writes_checkpoint_and_resumes() {
        let tmp = TempDir::new().unwrap();
        for split in ["train", "val"] {
            write_class(&tmp.path().join(split), "A", 6, [200, 20, 20]);
            write_class(&tmp.path().join(split), "B", 5, [20, 200, 20]);
        }
        let (mut training, model_settings) = settings(tmp.path(), 1);

        let mut epochs_seen = Vec::new();
        let report = run_training::<TestBackend, _>(&training, &model_settings, Default::default(), |s| {
            epochs_seen.push(s.epoch)
        })
        .unwrap();

        assert_eq!(epochs_seen, vec![1]);
        assert!(report.checkpoint.exists());
        assert_eq!(report.metadata.epochs_completed, 1);
        assert_eq!(report.metadata.labels.names(), ["A", "B"]);
        let first = &report.metadata.history[0];
        assert_eq!(first.train_samples, 11);
        assert_eq!(first.train_batches, 3);
        assert!(first.val_loss.is_some_and(f64::is_finite));

        // 同じチェックポイントから1エポック追加
        training.checkpoint_in = Some(report.checkpoint.clone());
        training.checkpoint_out = tmp.path().join("out").join("resumed.tar.gz");
        let resumed = run_training::<TestBackend, _>(&training, &model_settings, Default::default(), |_| {}).unwrap();

        assert_eq!(resumed.metadata.epochs_completed, 2);
        assert_eq!(resumed.metadata.history.len(), 2);
        assert_eq!(resumed.metadata.history[1].epoch, 2);
    }

    #[test]
    fn test_mismatched_validation_classes_fail_before_training() {
        let tmp = TempDir::new().unwrap();
        write_class(&tmp.path().join("train"), "A", 2, [1, 2, 3]);
        write_class(&tmp.path().join("train"), "B", 2, [1, 2, 3]);
        write_class(&tmp.path().join("val"), "A", 2, [1, 2, 3]);
        write_class(&tmp.path().join("val"), "C", 2, [1, 2, 3]);
        let (training, model_settings) = settings(tmp.path(), 1);

        let err = run_training::<TestBackend, _>(&training, &model_settings, Default::default(), |_| {});
        assert!(matches!(err, Err(Error::Data(_))));
        assert!(!training.checkpoint_out.exists());
    }

    #[test]
    fn test_check_device_accepts_model_device() {
        let device = Default::default();
        let model = tiny_config(2).init::<NdArray<f32>>(&device);
        assert!(check_device(&model, &device).is_ok());
    }
}
