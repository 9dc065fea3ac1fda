//! モバイル向けエクスポート
//!
//! 学習済みモデルを、計算グラフ・重み・ラベルを1つにまとめたアーカイブとして
//! 書き出します。書き出しは推論モード（自動微分なしのバックエンド）のモデルに
//! 対してのみ行い、出力先ランタイムが未対応の演算を含む場合は失敗します。
//!
//! アーカイブの構成（tar.gz内部）:
//! - metadata.json - ランタイム、精度、ラベル、モデル設定
//! - graph.json    - 推論グラフ（ノード列）
//! - weights.bin   - 重み（バイナリレコード、f32 または f16）

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::ml::classifier::{Classifier, ClassifierConfig};
use crate::ml::inference::Prediction;
use crate::ml::labels::LabelSpace;
use crate::ml::preprocess::ImageTransform;
use crate::model::model_storage::{read_bundle, write_bundle, METADATA_ENTRY};

pub const GRAPH_ENTRY: &str = "graph.json";
pub const WEIGHTS_ENTRY: &str = "weights.bin";

/// 計算グラフの演算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphOp {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        groups: usize,
    },
    Silu,
    Add,
    GlobalAvgPool,
    Flatten,
    Linear {
        in_features: usize,
        out_features: usize,
    },
    Dropout {
        prob: f64,
    },
}

impl GraphOp {
    /// ランタイムの対応表で使う演算名
    pub fn kind(&self) -> &'static str {
        match self {
            GraphOp::Conv2d {
                in_channels,
                groups,
                ..
            } if *groups > 1 && groups == in_channels => "depthwise_conv2d",
            GraphOp::Conv2d { .. } => "conv2d",
            GraphOp::Silu => "silu",
            GraphOp::Add => "add",
            GraphOp::GlobalAvgPool => "global_avg_pool",
            GraphOp::Flatten => "flatten",
            GraphOp::Linear { .. } => "linear",
            GraphOp::Dropout { .. } => "dropout",
        }
    }

    /// 推論時には恒等写像になる演算
    pub fn is_training_only(&self) -> bool {
        matches!(self, GraphOp::Dropout { .. })
    }
}

/// 計算グラフのノード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub op: GraphOp,
}

impl GraphNode {
    pub fn new(name: String, op: GraphOp) -> Self {
        Self { name, op }
    }
}

/// 推論グラフに変換（学習時専用の演算を除去）
pub fn lower_for_inference(nodes: Vec<GraphNode>) -> Vec<GraphNode> {
    nodes
        .into_iter()
        .filter(|node| !node.op.is_training_only())
        .collect()
}

/// エクスポート先ランタイムの対応演算
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeProfile {
    pub name: String,
    pub supported_ops: Vec<String>,
}

impl RuntimeProfile {
    pub fn new<I, S>(name: &str, supported_ops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            supported_ops: supported_ops.into_iter().map(Into::into).collect(),
        }
    }

    /// モバイル推論ランタイム
    pub fn mobile() -> Self {
        Self::new(
            "mobile",
            [
                "conv2d",
                "depthwise_conv2d",
                "silu",
                "add",
                "global_avg_pool",
                "flatten",
                "linear",
            ],
        )
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.supported_ops.iter().any(|op| op == kind)
    }

    /// 全ノードが対応演算かを検証
    pub fn check(&self, nodes: &[GraphNode]) -> Result<()> {
        match nodes.iter().find(|node| !self.supports(node.op.kind())) {
            Some(node) => Err(Error::UnsupportedOp {
                runtime: self.name.clone(),
                node: node.name.clone(),
                op: node.op.kind().to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// 重みの保存精度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportPrecision {
    /// f32
    #[default]
    Full,
    /// f16
    Half,
}

/// エクスポート設定
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub runtime: RuntimeProfile,
    pub precision: ExportPrecision,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            runtime: RuntimeProfile::mobile(),
            precision: ExportPrecision::Full,
        }
    }
}

/// エクスポート成果物のメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub runtime: RuntimeProfile,
    pub precision: ExportPrecision,
    pub labels: LabelSpace,
    pub classifier: ClassifierConfig,
    pub exported_at: String,
}

impl ExportMetadata {
    fn validate(&self) -> Result<()> {
        if !self.labels.is_bijective() || self.labels.len() != self.classifier.num_classes {
            return Err(Error::LoadMismatch(format!(
                "artifact has {} labels for {} outputs",
                self.labels.len(),
                self.classifier.num_classes
            )));
        }
        self.classifier
            .validate()
            .map_err(|e| Error::LoadMismatch(format!("invalid classifier config: {e}")))
    }
}

/// 学習済みモデルをモバイル向け成果物として書き出す
///
/// `model` は自動微分なしのバックエンド上のモデル（`AutodiffModule::valid()` の結果など）
/// なので、ドロップアウトは無効の状態で書き出されます。
///
/// # 戻り値
/// - 書き込んだファイルのパス
pub fn export_model<B: Backend>(
    model: &Classifier<B>,
    config: &ClassifierConfig,
    labels: &LabelSpace,
    options: &ExportOptions,
    output_path: &Path,
) -> Result<PathBuf> {
    config.validate()?;
    if labels.len() != config.num_classes {
        return Err(Error::LoadMismatch(format!(
            "{} labels for {} outputs",
            labels.len(),
            config.num_classes
        )));
    }
    let (width, height) = model.input_size();
    if (width, height) != (config.image_width, config.image_height) {
        return Err(Error::ShapeMismatch {
            stage: "export",
            expected: vec![config.image_height, config.image_width],
            actual: vec![height, width],
        });
    }

    config.ensure_matches(model)?;

    let graph = lower_for_inference(config.graph());
    options.runtime.check(&graph)?;

    let record = model.clone().into_record();
    let weights = match options.precision {
        ExportPrecision::Full => BinBytesRecorder::<FullPrecisionSettings>::default().record(record, ()),
        ExportPrecision::Half => BinBytesRecorder::<HalfPrecisionSettings>::default().record(record, ()),
    }
    .map_err(|e| Error::Record(format!("{e:?}")))?;

    let metadata = ExportMetadata {
        runtime: options.runtime.clone(),
        precision: options.precision,
        labels: labels.clone(),
        classifier: config.clone(),
        exported_at: chrono::Local::now().to_rfc3339(),
    };
    let metadata_json = serde_json::to_vec_pretty(&metadata)?;
    let graph_json = serde_json::to_vec_pretty(&graph)?;

    let path = write_bundle(
        output_path,
        &[
            (METADATA_ENTRY, metadata_json.as_slice()),
            (GRAPH_ENTRY, graph_json.as_slice()),
            (WEIGHTS_ENTRY, weights.as_slice()),
        ],
    )?;

    info!(
        path = %path.display(),
        runtime = %options.runtime.name,
        precision = ?options.precision,
        nodes = graph.len(),
        weight_bytes = weights.len(),
        "モデルをエクスポートしました"
    );
    Ok(path)
}

/// エクスポート成果物を読み込んだ推論専用モデル
pub struct MobileModel<B: Backend> {
    model: Classifier<B>,
    metadata: ExportMetadata,
    graph: Vec<GraphNode>,
    device: B::Device,
}

impl<B: Backend> MobileModel<B> {
    /// 成果物を読み込む
    ///
    /// 同梱のグラフがモデル設定から導かれるものと一致しない場合や、
    /// 重みの構造が異なる場合は `LoadMismatch` になります。
    pub fn load(path: &Path, device: &B::Device) -> Result<Self> {
        let mut bundle = read_bundle(path)?;
        let metadata: ExportMetadata = serde_json::from_slice(&bundle.take(METADATA_ENTRY)?)?;
        metadata.validate()?;

        let graph: Vec<GraphNode> = serde_json::from_slice(&bundle.take(GRAPH_ENTRY)?)?;
        if graph != lower_for_inference(metadata.classifier.graph()) {
            return Err(Error::LoadMismatch(format!(
                "graph in {} does not match its classifier config",
                path.display()
            )));
        }
        metadata.runtime.check(&graph)?;

        let weights = bundle.take(WEIGHTS_ENTRY)?;
        let fresh = metadata.classifier.init::<B>(device);

        let record: <Classifier<B> as Module<B>>::Record = match metadata.precision {
            ExportPrecision::Full => BinBytesRecorder::<FullPrecisionSettings>::default().load(weights, device),
            ExportPrecision::Half => BinBytesRecorder::<HalfPrecisionSettings>::default().load(weights, device),
        }
        .map_err(|e| Error::LoadMismatch(format!("{e:?}")))?;
        let model = fresh.load_record(record);
        metadata.classifier.ensure_matches(&model)?;

        Ok(Self {
            model,
            metadata,
            graph,
            device: device.clone(),
        })
    }

    pub fn metadata(&self) -> &ExportMetadata {
        &self.metadata
    }

    pub fn graph(&self) -> &[GraphNode] {
        &self.graph
    }

    pub fn labels(&self) -> &LabelSpace {
        &self.metadata.labels
    }

    pub fn transform(&self) -> ImageTransform {
        self.metadata.classifier.transform()
    }

    /// ロジットを計算
    pub fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        self.model.forward(images)
    }

    /// 1枚の画像を分類
    pub fn classify(&self, image: &DynamicImage) -> Result<Prediction> {
        let transform = self.transform();
        let input = transform.to_tensor::<B>(transform.apply(image), &self.device)?;
        let scores = self
            .model
            .predict(input)?
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::Record(format!("{e:?}")))?;
        Prediction::from_scores(scores, &self.metadata.labels)
    }
}
