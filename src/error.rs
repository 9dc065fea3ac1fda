//! パイプライン共通のエラー定義

use std::path::PathBuf;

/// データセット構築・学習・推論・エクスポートで発生するエラー
///
/// ライブラリ内では回復せず、中断するかスキップするかは呼び出し側が決めます。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// クラスディレクトリの欠落・空、学習/検証のクラス不一致など
    #[error("data error: {0}")]
    Data(String),

    /// 画像のデコード失敗
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// サンプルインデックスが範囲外
    #[error("sample index {index} out of range (dataset has {len} samples)")]
    OutOfRange { index: usize, len: usize },

    /// ステージ境界でのテンソル形状の不一致
    #[error("shape mismatch at {stage}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        stage: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// 損失が有限値でない（NaN / Inf）
    #[error("non-finite {phase} loss ({value}) at epoch {epoch}, batch {batch}")]
    NumericInstability {
        phase: &'static str,
        epoch: usize,
        batch: usize,
        value: f64,
    },

    /// 保存済みパラメータとモデル構造の不一致
    #[error("checkpoint does not match the architecture: {0}")]
    LoadMismatch(String),

    /// モデルとバッチのデバイス不一致
    #[error("device mismatch: expected {expected}, found {found}")]
    DeviceMismatch { expected: String, found: String },

    /// 文字が割り当てられていないクラスインデックス
    #[error("class index {0} has no letter (valid range is 0..=28)")]
    UnknownClass(usize),

    /// エクスポート先ランタイムが未対応の演算
    #[error("op `{op}` (node `{node}`) is not supported by runtime `{runtime}`")]
    UnsupportedOp {
        runtime: String,
        node: String,
        op: String,
    },

    /// チェックポイント・成果物ファイルの読み書き失敗
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// burn レコーダーでのシリアライズ失敗
    #[error("record error: {0}")]
    Record(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// I/Oエラーに対象パスを付与
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
