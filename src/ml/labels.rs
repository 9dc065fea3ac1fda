//! ラベル空間と文字マッピング
//!
//! クラス名 ↔ インデックスの対応と、推論結果を人間向けの文字に変換する
//! 固定テーブルを提供します。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// クラス数（A-Z の26文字 + delete / empty / space）
pub const NUM_CLASSES: usize = 29;

/// ラベル空間（クラス名 ↔ インデックス `0..N-1` の全単射）
///
/// サブディレクトリ名のソート順で構築し、チェックポイントに同梱して保存します。
/// 推論時はディレクトリを再走査せず、学習時の割り当てをそのまま使います。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSpace {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelSpace {
    /// 名前をソート・重複除去してからインデックスを割り当てる
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self::from_ordered(names)
    }

    fn from_ordered(names: Vec<String>) -> Self {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { names, index }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn class_name_of(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// 重複のない名前列から作られているか（読み込んだメタデータの検証用）
    pub fn is_bijective(&self) -> bool {
        self.index.len() == self.names.len()
    }
}

impl From<Vec<String>> for LabelSpace {
    // 永続化された順序をそのまま使う（再ソートしない）
    fn from(names: Vec<String>) -> Self {
        Self::from_ordered(names)
    }
}

impl From<LabelSpace> for Vec<String> {
    fn from(labels: LabelSpace) -> Self {
        labels.names
    }
}

/// クラスインデックスを文字に変換
///
/// - 0..=25: `A`..`Z`
/// - 26: `delete`
/// - 27: `empty`
/// - 28: `space`
///
/// 範囲外のインデックスは `UnknownClass` エラーになります。
pub fn predict_letter(index: usize) -> Result<String> {
    match index {
        0..=25 => Ok(char::from(b'A' + index as u8).to_string()),
        26 => Ok("delete".to_string()),
        27 => Ok("empty".to_string()),
        28 => Ok("space".to_string()),
        _ => Err(Error::UnknownClass(index)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letter_table() {
        assert_eq!(predict_letter(0).unwrap(), "A");
        assert_eq!(predict_letter(25).unwrap(), "Z");
        assert_eq!(predict_letter(26).unwrap(), "delete");
        assert_eq!(predict_letter(27).unwrap(), "empty");
        assert_eq!(predict_letter(28).unwrap(), "space");
    }

    #[test]
    fn test_letter_out_of_range_fails() {
        assert!(matches!(predict_letter(29), Err(Error::UnknownClass(29))));
        assert!(predict_letter(usize::MAX).is_err());
    }

    #[test]
    fn test_label_space_is_bijection() {
        let labels = LabelSpace::from_names(["space", "B", "A", "del", "nothing", "A"]);
        assert_eq!(labels.len(), 5);
        for i in 0..labels.len() {
            let name = labels.class_name_of(i).unwrap();
            assert_eq!(labels.index_of(name), Some(i));
        }
        assert_eq!(labels.class_name_of(0), Some("A"));
        assert_eq!(labels.class_name_of(5), None);
        assert_eq!(labels.index_of("Q"), None);
    }

    #[test]
    fn test_duplicate_persisted_names_are_detected() {
        let labels: LabelSpace = serde_json::from_str(r#"["a","a"]"#).unwrap();
        assert!(!labels.is_bijective());
    }

    #[test]
    fn test_persisted_order_is_kept() {
        let json = r#"["b","a"]"#;
        let labels: LabelSpace = serde_json::from_str(json).unwrap();
        assert_eq!(labels.index_of("b"), Some(0));
        assert!(labels.is_bijective());
        assert_eq!(serde_json::to_string(&labels).unwrap(), json);
    }
}
