//! モデルメタデータの定義と永続化
//!
//! チェックポイントに同梱され、推論や学習再開時にディレクトリを再走査せずに
//! 同じラベル割り当て・同じモデル構造・同じ入力解像度を復元するために使います。

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ml::classifier::ClassifierConfig;
use crate::ml::labels::LabelSpace;
use crate::ml::preprocess::ImageTransform;
use crate::ml::training::EpochSummary;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.mpk: モデルの重み
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（インデックス順）
    pub labels: LabelSpace,

    /// モデル構造（入力解像度を含む）
    pub classifier: ClassifierConfig,

    /// 完了したエポック数（学習再開時の起点）
    pub epochs_completed: usize,

    /// エポックごとの損失・正解率
    #[serde(default)]
    pub history: Vec<EpochSummary>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        labels: LabelSpace,
        classifier: ClassifierConfig,
        epochs_completed: usize,
        history: Vec<EpochSummary>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            labels,
            classifier,
            epochs_completed,
            history,
            trained_at,
        }
    }

    /// 学習時と同じ前処理
    pub fn transform(&self) -> ImageTransform {
        self.classifier.transform()
    }

    /// 読み込んだメタデータの整合性を検証
    pub fn validate(&self) -> Result<()> {
        if !self.labels.is_bijective() {
            return Err(Error::LoadMismatch(
                "label space contains duplicate class names".to_string(),
            ));
        }
        if self.labels.len() != self.classifier.num_classes {
            return Err(Error::LoadMismatch(format!(
                "label space has {} classes but the classifier has {} outputs",
                self.labels.len(),
                self.classifier.num_classes
            )));
        }
        self.classifier
            .validate()
            .map_err(|e| Error::LoadMismatch(format!("invalid classifier config: {e}")))
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSONからメタデータを生成して検証
    pub fn from_json_slice(json: &[u8]) -> Result<Self> {
        let metadata: Self = serde_json::from_slice(json)?;
        metadata.validate()?;
        Ok(metadata)
    }
}
