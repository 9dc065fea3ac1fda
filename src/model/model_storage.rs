//! モデルとメタデータの永続化
//!
//! Tar.gz形式で複数のエントリを1ファイルに統合して保存・読み込みします。
//!
//! チェックポイントの構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル空間、モデル設定、学習履歴）
//! - model.mpk       - モデルの重み（名前付きレコード）
//! - optimizer.mpk   - オプティマイザの状態（学習再開用、任意）
//!
//! 書き込みは同じディレクトリの一時ファイルに行い、完了後にリネームします。
//! 途中で失敗しても既存のファイルは壊れません。

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::model_metadata::ModelMetadata;

pub const METADATA_ENTRY: &str = "metadata.json";
pub const MODEL_ENTRY: &str = "model.mpk";
pub const OPTIMIZER_ENTRY: &str = "optimizer.mpk";

/// 保存先パスを正規化
///
/// すでに `.gz` で終わっている場合はそのまま、そうでなければ `.tar.gz` を付けます。
pub fn bundle_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// 名前付きエントリをTar.gzとして原子的に書き込む
///
/// # 戻り値
/// - 実際に書き込んだパス
pub fn write_bundle(output_path: &Path, entries: &[(&str, &[u8])]) -> Result<PathBuf> {
    let tar_gz_path = bundle_path(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let file_name = tar_gz_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Data(format!("invalid output path: {}", tar_gz_path.display())))?;
    let temp_path = tar_gz_path.with_file_name(format!(".{file_name}.partial"));

    if let Err(e) = write_archive(&temp_path, entries) {
        std::fs::remove_file(&temp_path).ok();
        return Err(e);
    }

    std::fs::rename(&temp_path, &tar_gz_path).map_err(|e| {
        std::fs::remove_file(&temp_path).ok();
        Error::io(&tar_gz_path, e)
    })?;

    debug!(path = %tar_gz_path.display(), entries = entries.len(), "アーカイブを書き込みました");
    Ok(tar_gz_path)
}

fn write_archive(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    let io_err = |e| Error::io(path, e);

    let tar_gz_file = File::create(path).map_err(io_err)?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(name).map_err(io_err)?;
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar_builder.append(&header, *data).map_err(io_err)?;
    }

    // tarアーカイブを完成させ、ディスクまで書き出す
    let encoder = tar_builder.into_inner().map_err(io_err)?;
    let file = encoder.finish().map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    Ok(())
}

/// 読み込んだアーカイブ
#[derive(Debug)]
pub struct Bundle {
    path: PathBuf,
    entries: HashMap<String, Vec<u8>>,
}

impl Bundle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// エントリを取り出す（存在しなければエラー）
    pub fn take(&mut self, name: &str) -> Result<Vec<u8>> {
        self.entries.remove(name).ok_or_else(|| {
            Error::Data(format!("{name} not found in {}", self.path.display()))
        })
    }

    pub fn take_optional(&mut self, name: &str) -> Option<Vec<u8>> {
        self.entries.remove(name)
    }
}

/// Tar.gzの全エントリを読み込む
pub fn read_bundle(tar_gz_path: &Path) -> Result<Bundle> {
    read_entries(tar_gz_path, |_| true)
}

fn read_entries(tar_gz_path: &Path, wanted: impl Fn(&str) -> bool) -> Result<Bundle> {
    let io_err = |e| Error::io(tar_gz_path, e);

    let tar_gz_file = File::open(tar_gz_path).map_err(io_err)?;
    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut entries = HashMap::new();
    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        let name = entry.path().map_err(io_err)?.to_string_lossy().into_owned();
        if !wanted(&name) {
            continue;
        }
        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer).map_err(io_err)?;
        entries.insert(name, buffer);
    }

    Ok(Bundle {
        path: tar_gz_path.to_path_buf(),
        entries,
    })
}

/// 読み込んだチェックポイント
#[derive(Debug)]
pub struct StoredModel {
    pub metadata: ModelMetadata,
    pub model: Vec<u8>,
    pub optimizer: Option<Vec<u8>>,
}

/// メタデータと共にモデルをTar.gz形式で保存
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
    optimizer_binary: Option<&[u8]>,
) -> Result<PathBuf> {
    let json = metadata.to_json_string()?;

    let mut entries: Vec<(&str, &[u8])> = vec![
        (METADATA_ENTRY, json.as_bytes()),
        (MODEL_ENTRY, model_binary),
    ];
    if let Some(optimizer) = optimizer_binary {
        entries.push((OPTIMIZER_ENTRY, optimizer));
    }

    write_bundle(output_path, &entries)
}

/// Tar.gzからモデルメタデータのみを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut bundle = read_entries(tar_gz_path, |name| name == METADATA_ENTRY)?;
    let json = bundle.take(METADATA_ENTRY)?;
    ModelMetadata::from_json_slice(&json)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<StoredModel> {
    let mut bundle = read_bundle(tar_gz_path)?;
    let metadata = ModelMetadata::from_json_slice(&bundle.take(METADATA_ENTRY)?)?;
    let model = bundle.take(MODEL_ENTRY)?;
    let optimizer = bundle.take_optional(OPTIMIZER_ENTRY);

    Ok(StoredModel {
        metadata,
        model,
        optimizer,
    })
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    let config = &metadata.classifier;
    println!("\n=== モデルメタデータ ===");
    println!("クラス数: {}", metadata.labels.len());
    println!("クラス: {}", metadata.labels.names().join(", "));
    println!("入力サイズ: {}x{}", config.image_width, config.image_height);
    println!("埋め込み次元: {}", config.backbone.embedding_dim);
    println!("ドロップアウト率: {}", config.dropout);
    println!("学習エポック数: {}", metadata.epochs_completed);
    for summary in &metadata.history {
        println!("  {summary}");
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bundle_path_extension() {
        assert_eq!(bundle_path(Path::new("out/model")), PathBuf::from("out/model.tar.gz"));
        assert_eq!(bundle_path(Path::new("out/model.tar.gz")), PathBuf::from("out/model.tar.gz"));
    }

    #[test]
    fn test_write_and_read_entries() {
        let tmp = TempDir::new().unwrap();
        let path = write_bundle(
            &tmp.path().join("nested").join("bundle.tar.gz"),
            &[("a.json", b"{}".as_slice()), ("b.bin", [1u8, 2, 3].as_slice())],
        )
        .unwrap();

        let mut bundle = read_bundle(&path).unwrap();
        assert!(bundle.contains("a.json"));
        assert_eq!(bundle.take("b.bin").unwrap(), vec![1, 2, 3]);
        assert!(bundle.take("b.bin").is_err());
        assert!(bundle.take_optional("missing").is_none());
    }

    #[test]
    fn test_no_partial_file_left_behind() {
        let tmp = TempDir::new().unwrap();
        write_bundle(&tmp.path().join("x.tar.gz"), &[("a", b"1".as_slice())]).unwrap();

        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["x.tar.gz".to_string()]);
    }

    #[test]
    fn test_overwrite_replaces_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x.tar.gz");
        write_bundle(&path, &[("a", b"old".as_slice())]).unwrap();
        write_bundle(&path, &[("a", b"new".as_slice())]).unwrap();

        assert_eq!(read_bundle(&path).unwrap().take("a").unwrap(), b"new".to_vec());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = read_bundle(Path::new("/nonexistent/x.tar.gz"));
        assert!(matches!(err, Err(Error::Io { .. })));
    }
}
