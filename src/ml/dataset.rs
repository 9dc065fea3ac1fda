//! 学習データセット
//!
//! ルート直下のサブディレクトリをクラスとみなし、その中の画像ファイルを
//! サンプルとして列挙します。画像本体は `get` のたびに読み込みます。

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ml::labels::LabelSpace;
use crate::ml::preprocess::ImageTransform;

/// 対象とする画像拡張子
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// 前処理済みサンプル
#[derive(Debug, Clone)]
pub struct Sample {
    /// (C, H, W) 順に平坦化された画素値
    pub pixels: Vec<f32>,
    /// クラスインデックス
    pub label: usize,
}

/// ジェスチャー画像データセット（パスのリストのみ保持）
#[derive(Debug, Clone)]
pub struct GestureDataset {
    root: PathBuf,
    samples: Vec<(PathBuf, usize)>, // (画像パス, クラスID)
    labels: LabelSpace,
    transform: ImageTransform,
}

impl GestureDataset {
    /// ディレクトリからデータセットを構築
    ///
    /// クラスはサブディレクトリ名のソート順でインデックスが決まります。
    pub fn from_directory(root: &Path, transform: ImageTransform) -> Result<Self> {
        let class_names = list_class_dirs(root)?;
        if class_names.is_empty() {
            return Err(Error::Data(format!(
                "no class directories found in {}",
                root.display()
            )));
        }
        let labels = LabelSpace::from_names(class_names);
        Self::from_directory_with_labels(root, labels, transform)
    }

    /// 既存のラベル空間に従ってディレクトリを読み込む
    ///
    /// 検証データやチェックポイントから再開する場合に使います。ディレクトリ上の
    /// クラス集合がラベル空間と一致しない場合はエラーになります。
    pub fn from_directory_with_labels(
        root: &Path,
        labels: LabelSpace,
        transform: ImageTransform,
    ) -> Result<Self> {
        let found = LabelSpace::from_names(list_class_dirs(root)?);
        if found.names() != labels.names() {
            return Err(Error::Data(format!(
                "class directories in {} ({}) do not match the label space ({})",
                root.display(),
                found.names().join(", "),
                labels.names().join(", ")
            )));
        }

        let mut samples = Vec::new();
        let mut empty_classes = Vec::new();

        for (class_id, class_name) in labels.names().iter().enumerate() {
            let class_dir = root.join(class_name);
            let files = list_image_files(&class_dir)?;
            if files.is_empty() {
                empty_classes.push(class_name.clone());
            }
            debug!(class = %class_name, class_id, count = files.len(), "クラスを読み込みました");
            samples.extend(files.into_iter().map(|path| (path, class_id)));
        }

        if !empty_classes.is_empty() {
            return Err(Error::Data(format!(
                "class directories without images in {}: {}",
                root.display(),
                empty_classes.join(", ")
            )));
        }

        info!(
            root = %root.display(),
            samples = samples.len(),
            classes = labels.len(),
            "データセットを読み込みました"
        );

        Ok(Self {
            root: root.to_path_buf(),
            samples,
            labels,
            transform,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// サンプル総数
    pub fn size(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// ラベル空間
    pub fn classes(&self) -> &LabelSpace {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn transform(&self) -> ImageTransform {
        self.transform
    }

    /// サンプルの画像パスとクラスID
    pub fn entry(&self, index: usize) -> Result<(&Path, usize)> {
        self.samples
            .get(index)
            .map(|(path, label)| (path.as_path(), *label))
            .ok_or(Error::OutOfRange {
                index,
                len: self.samples.len(),
            })
    }

    /// インデックスのサンプルを読み込み、前処理して返す
    pub fn get(&self, index: usize) -> Result<Sample> {
        let (path, label) = self.entry(index)?;
        let pixels = self.transform.load(path)?;
        Ok(Sample { pixels, label })
    }
}

/// ルート直下のディレクトリ名を列挙
fn list_class_dirs(root: &Path) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(root).map_err(|e| Error::io(root, e))?;
    let mut names = Vec::new();

    for entry in entries {
        let path = entry.map_err(|e| Error::io(root, e))?.path();
        if !path.is_dir() {
            continue;
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Data(format!("invalid class directory name: {}", path.display())))?;
        names.push(name.to_string());
    }

    names.sort();
    Ok(names)
}

/// ディレクトリ内の画像ファイルをソート済みで列挙
pub fn list_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut files = Vec::new();

    for entry in entries {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_file() && is_image_file(&path) {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_class(root: &Path, class: &str, count: usize, size: u32) {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let image = RgbImage::from_pixel(size, size, Rgb([i as u8 * 20, 100, 200]));
            image.save(dir.join(format!("{class}_{i:02}.png"))).unwrap();
        }
    }

    #[test]
    fn test_classes_sorted_and_samples_labelled() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "B", 3, 20);
        write_class(tmp.path(), "A", 2, 20);
        std::fs::write(tmp.path().join("A").join("notes.txt"), "skip").unwrap();

        let transform = ImageTransform::new(16, 16);
        let dataset = GestureDataset::from_directory(tmp.path(), transform).unwrap();

        assert_eq!(dataset.classes().names(), ["A", "B"]);
        assert_eq!(dataset.size(), 5);
        for i in 0..dataset.size() {
            let sample = dataset.get(i).unwrap();
            assert_eq!(sample.pixels.len(), 3 * 16 * 16);
            assert!(sample.label < dataset.num_classes());
        }
        assert_eq!(dataset.get(0).unwrap().label, 0);
        assert_eq!(dataset.get(4).unwrap().label, 1);
    }

    #[test]
    fn test_out_of_range() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "A", 1, 8);
        let dataset = GestureDataset::from_directory(tmp.path(), ImageTransform::new(8, 8)).unwrap();

        assert!(matches!(
            dataset.get(1),
            Err(Error::OutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_empty_class_is_data_error() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "A", 1, 8);
        std::fs::create_dir_all(tmp.path().join("B")).unwrap();

        let err = GestureDataset::from_directory(tmp.path(), ImageTransform::new(8, 8));
        assert!(matches!(err, Err(Error::Data(_))));
    }

    #[test]
    fn test_mismatched_label_space_is_data_error() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "A", 1, 8);
        write_class(tmp.path(), "C", 1, 8);

        let labels = LabelSpace::from_names(["A", "B"]);
        let err = GestureDataset::from_directory_with_labels(tmp.path(), labels, ImageTransform::new(8, 8));
        assert!(matches!(err, Err(Error::Data(_))));
    }

    #[test]
    fn test_corrupt_image_fails_on_get() {
        let tmp = TempDir::new().unwrap();
        write_class(tmp.path(), "A", 1, 8);
        std::fs::write(tmp.path().join("A").join("broken.png"), b"not a png").unwrap();

        let dataset = GestureDataset::from_directory(tmp.path(), ImageTransform::new(8, 8)).unwrap();
        assert_eq!(dataset.size(), 2);
        assert!(matches!(dataset.get(1), Err(Error::Image { .. })));
    }
}
