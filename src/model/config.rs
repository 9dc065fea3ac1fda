//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・モデル構成・学習パラメータをJSON形式で保存・読み込みします。
//! コマンドライン引数で個別に上書きできます。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::ml::backbone::BackboneConfig;
use crate::ml::preprocess::IMAGE_SIZE;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

fn default_backbone() -> BackboneConfig {
    BackboneConfig::new()
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// ヘッド直前のドロップアウト率
    pub dropout: f64,
    /// 事前学習済みバックボーンのレコード（.mpk）
    #[serde(default)]
    pub pretrained_backbone: Option<PathBuf>,
    /// バックボーンを固定してヘッドのみ学習する
    #[serde(default)]
    pub freeze_backbone: bool,
    /// バックボーン構成
    #[serde(default = "default_backbone")]
    pub backbone: BackboneConfig,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            dropout: 0.0,
            pretrained_backbone: None,
            freeze_backbone: false,
            backbone: default_backbone(),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// 学習データのルート（クラスごとのサブディレクトリ）
    pub data_dir: PathBuf,
    /// 検証データのルート
    #[serde(default)]
    pub val_dir: Option<PathBuf>,
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 画像読み込みのワーカー数（0で呼び出しスレッドのみ）
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 入力画像の幅
    pub image_width: usize,
    /// 入力画像の高さ
    pub image_height: usize,
    /// 学習を再開するチェックポイント
    #[serde(default)]
    pub checkpoint_in: Option<PathBuf>,
    /// 学習後に書き出すチェックポイント
    pub checkpoint_out: PathBuf,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/asl_alphabet_train"),
            val_dir: Some(PathBuf::from("data/asl_alphabet_test")),
            num_epochs: 5,
            batch_size: 32,
            num_workers: 4,
            learning_rate: 1e-3,
            seed: 42,
            image_width: IMAGE_SIZE,
            image_height: IMAGE_SIZE,
            checkpoint_in: None,
            checkpoint_out: PathBuf::from("models/asl_classifier.tar.gz"),
        }
    }
}

impl TrainingSettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Data("batch_size must be at least 1".to_string()));
        }
        if self.image_width == 0 || self.image_height == 0 {
            return Err(Error::Data(format!(
                "invalid image size {}x{}",
                self.image_width, self.image_height
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Data(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 設定ファイルを読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "設定ファイルを読み込みました");
                config
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "設定ファイルの読み込みに失敗しました。デフォルト設定を使用します"
                );
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| Error::io(path, e))
    }

    /// 設定情報をログに出力
    pub fn log_summary(&self) {
        let t = &self.training;
        info!(
            device = %self.device_type,
            dropout = self.model.dropout,
            freeze_backbone = self.model.freeze_backbone,
            pretrained_backbone = ?self.model.pretrained_backbone,
            "モデル設定"
        );
        info!(
            data_dir = %t.data_dir.display(),
            val_dir = ?t.val_dir,
            epochs = t.num_epochs,
            batch_size = t.batch_size,
            learning_rate = t.learning_rate,
            seed = t.seed,
            width = t.image_width,
            height = t.image_height,
            "トレーニング設定"
        );
    }
}
