//! ASL 指文字の画像分類
//!
//! - `ml`: データセット、モデル、学習ループ、推論、エクスポート
//! - `model`: 設定ファイル、メタデータ、チェックポイントの保存形式

pub mod error;
pub mod ml;
pub mod model;

pub use error::{Error, Result};
