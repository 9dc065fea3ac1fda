//! モデル推論機能

use std::path::{Path, PathBuf};

use burn::tensor::{backend::Backend, Tensor};
use image::DynamicImage;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ml::classifier::{argmax_rows, Classifier};
use crate::ml::dataset::list_image_files;
use crate::ml::labels::{predict_letter, LabelSpace};
use crate::ml::preprocess::ImageTransform;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::load_model_with_metadata;

/// 1枚分の推論結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// 最大スコアのクラスインデックス
    pub index: usize,
    /// 学習時のクラス名（ディレクトリ名）
    pub class_name: String,
    /// 表示用の文字
    pub letter: String,
    /// `index` の確率
    pub confidence: f32,
    /// 全クラスの確率（ソフトマックス後）
    pub scores: Vec<f32>,
}

impl Prediction {
    /// 確率ベクトルから推論結果を組み立てる
    pub fn from_scores(scores: Vec<f32>, labels: &LabelSpace) -> Result<Self> {
        if scores.len() != labels.len() {
            return Err(Error::ShapeMismatch {
                stage: "prediction",
                expected: vec![labels.len()],
                actual: vec![scores.len()],
            });
        }

        let index = argmax_rows(&scores, scores.len())
            .first()
            .copied()
            .ok_or(Error::UnknownClass(0))?;
        let class_name = labels
            .class_name_of(index)
            .ok_or(Error::UnknownClass(index))?
            .to_string();

        Ok(Self {
            index,
            class_name,
            letter: predict_letter(index)?,
            confidence: scores[index],
            scores,
        })
    }
}

/// 推論エンジン
///
/// チェックポイントに保存されたラベル空間・入力解像度をそのまま使います。
pub struct InferenceEngine<B: Backend> {
    model: Classifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// チェックポイントを読み込んで推論エンジンを初期化
    pub fn load(checkpoint: &Path, device: &B::Device) -> Result<Self> {
        let stored = load_model_with_metadata(checkpoint)?;
        let model = stored
            .metadata
            .classifier
            .load_bytes::<B>(stored.model, device)?;

        info!(
            checkpoint = %checkpoint.display(),
            classes = stored.metadata.labels.len(),
            width = stored.metadata.classifier.image_width,
            height = stored.metadata.classifier.image_height,
            "モデルを読み込みました"
        );

        Ok(Self::from_model(model, stored.metadata, device.clone()))
    }

    /// 読み込み済みのモデルから作成
    pub fn from_model(model: Classifier<B>, metadata: ModelMetadata, device: B::Device) -> Self {
        Self {
            model,
            metadata,
            device,
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn model(&self) -> &Classifier<B> {
        &self.model
    }

    pub fn labels(&self) -> &LabelSpace {
        &self.metadata.labels
    }

    pub fn transform(&self) -> ImageTransform {
        self.metadata.transform()
    }

    /// 前処理済みバッチを分類
    pub fn predict_tensor(&self, images: Tensor<B, 4>) -> Result<Vec<Prediction>> {
        let num_classes = self.labels().len();
        let scores = self
            .model
            .predict(images)?
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::Record(format!("{e:?}")))?;

        scores
            .chunks(num_classes)
            .map(|row| Prediction::from_scores(row.to_vec(), self.labels()))
            .collect()
    }

    /// デコード済みの画像を分類
    pub fn classify_dynamic(&self, image: &DynamicImage) -> Result<Prediction> {
        let transform = self.transform();
        let input = transform.to_tensor::<B>(transform.apply(image), &self.device)?;
        self.predict_tensor(input)?
            .pop()
            .ok_or_else(|| Error::Data("model returned no prediction".to_string()))
    }

    /// 単一画像を分類
    pub fn classify_image(&self, image_path: &Path) -> Result<Prediction> {
        let transform = self.transform();
        let input = transform.to_tensor::<B>(transform.load(image_path)?, &self.device)?;
        let prediction = self
            .predict_tensor(input)?
            .pop()
            .ok_or_else(|| Error::Data("model returned no prediction".to_string()))?;

        debug!(
            path = %image_path.display(),
            index = prediction.index,
            letter = %prediction.letter,
            confidence = prediction.confidence,
            "分類しました"
        );
        Ok(prediction)
    }

    /// ディレクトリ内の画像をファイル名順に分類
    ///
    /// 1枚の失敗で全体を止めず、ファイルごとの結果を返します。
    pub fn classify_dir(&self, dir: &Path) -> Result<Vec<(PathBuf, Result<Prediction>)>> {
        let files = list_image_files(dir)?;
        Ok(files
            .into_iter()
            .map(|path| {
                let result = self.classify_image(&path);
                (path, result)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::BackboneConfig;
    use crate::ml::classifier::ClassifierConfig;
    use crate::model::model_storage::save_model_with_metadata;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn save_checkpoint(dir: &Path, num_classes: usize) -> PathBuf {
        let device = Default::default();
        let config = ClassifierConfig::new(num_classes)
            .with_image_width(24)
            .with_image_height(24)
            .with_backbone(
                BackboneConfig::new()
                    .with_stem_channels(4)
                    .with_stage_channels(vec![8])
                    .with_stage_strides(vec![2])
                    .with_embedding_dim(8),
            );
        let model = config.init::<TestBackend>(&device);
        let labels = LabelSpace::from_names((0..num_classes).map(|i| format!("c{i:02}")));
        let metadata = ModelMetadata::new(labels, config, 0, Vec::new());

        save_model_with_metadata(&dir.join("ckpt.tar.gz"), &metadata, &model.to_bytes().unwrap(), None).unwrap()
    }

    #[test]
    fn test_from_scores() {
        let labels = LabelSpace::from_names(["A", "B", "C"]);
        let prediction = Prediction::from_scores(vec![0.2, 0.5, 0.3], &labels).unwrap();

        assert_eq!(prediction.index, 1);
        assert_eq!(prediction.class_name, "B");
        assert_eq!(prediction.letter, "B");
        assert!((prediction.confidence - 0.5).abs() < 1e-6);

        assert!(matches!(
            Prediction::from_scores(vec![1.0], &labels),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_classify_dir_sorted_and_skips_bad_files() {
        let tmp = TempDir::new().unwrap();
        let checkpoint = save_checkpoint(tmp.path(), 3);
        let engine = InferenceEngine::<TestBackend>::load(&checkpoint, &Default::default()).unwrap();
        assert_eq!(engine.transform(), ImageTransform::new(24, 24));

        let images = tmp.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        for name in ["c.png", "a.png"] {
            RgbImage::from_pixel(50, 40, Rgb([120, 30, 200]))
                .save(images.join(name))
                .unwrap();
        }
        std::fs::write(images.join("b.png"), b"broken").unwrap();

        let results = engine.classify_dir(&images).unwrap();
        let names: Vec<String> = results
            .iter()
            .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.png", "b.png", "c.png"]);

        assert!(results[0].1.as_ref().unwrap().index < 3);
        assert!(matches!(results[1].1, Err(Error::Image { .. })));
        assert!(results[2].1.is_ok());
    }

    #[test]
    fn test_same_image_same_prediction() {
        let tmp = TempDir::new().unwrap();
        let checkpoint = save_checkpoint(tmp.path(), 4);
        let engine = InferenceEngine::<TestBackend>::load(&checkpoint, &Default::default()).unwrap();

        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(30, 30, |x, y| Rgb([x as u8 * 8, y as u8 * 8, 64])));
        let a = engine.classify_dynamic(&image).unwrap();
        let b = engine.classify_dynamic(&image).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_checkpoint() {
        let err = InferenceEngine::<TestBackend>::load(Path::new("/nonexistent/ckpt.tar.gz"), &Default::default());
        assert!(matches!(err, Err(Error::Io { .. })));
    }
}
