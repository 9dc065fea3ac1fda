//! 埋め込み抽出用バックボーン
//!
//! EfficientNet-B0 と同じステージ幅を持つ深さ方向分離畳み込みのスタックで、
//! 画像 [B, 3, H, W] を固定長ベクトル [B, embedding_dim] に写像します。
//! 全結合層を持たないため入力解像度に依存しません。事前学習済みの重みは
//! 名前付きレコードから読み込みます。

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        PaddingConfig2d,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{activation::silu, backend::Backend, Tensor},
};

use crate::error::Error;
use crate::ml::export::{GraphNode, GraphOp};
use crate::ml::shapes::ensure_same_shapes;
use crate::ml::preprocess::CHANNELS;

/// 埋め込み次元（EfficientNet-B0 の特徴量サイズ）
pub const EMBEDDING_DIM: usize = 1280;

/// バックボーン設定
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// ステム畳み込みの出力チャネル
    #[config(default = 32)]
    pub stem_channels: usize,
    /// 各ブロックの出力チャネル
    #[config(default = "vec![16, 24, 40, 80, 112, 192, 320]")]
    pub stage_channels: Vec<usize>,
    /// 各ブロックのストライド
    #[config(default = "vec![1, 2, 2, 2, 1, 2, 1]")]
    pub stage_strides: Vec<usize>,
    /// 出力埋め込み次元
    #[config(default = 1280)]
    pub embedding_dim: usize,
}

impl BackboneConfig {
    /// 設定の整合性を検証
    pub fn validate(&self) -> crate::Result<()> {
        if self.stage_channels.len() != self.stage_strides.len() {
            return Err(Error::ShapeMismatch {
                stage: "backbone config",
                expected: vec![self.stage_channels.len()],
                actual: vec![self.stage_strides.len()],
            });
        }
        if self.stem_channels == 0
            || self.embedding_dim == 0
            || self.stage_channels.contains(&0)
            || self.stage_strides.contains(&0)
        {
            return Err(Error::Data("backbone widths and strides must be non-zero".to_string()));
        }
        Ok(())
    }

    /// 最終ブロックの出力チャネル
    fn last_stage_channels(&self) -> usize {
        self.stage_channels
            .last()
            .copied()
            .unwrap_or(self.stem_channels)
    }

    /// バックボーンを初期化（ランダム重み）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let mut blocks = Vec::with_capacity(self.stage_channels.len());
        let mut in_channels = self.stem_channels;

        for (&out_channels, &stride) in self.stage_channels.iter().zip(&self.stage_strides) {
            blocks.push(SeparableBlock {
                depthwise: Conv2dConfig::new([in_channels, in_channels], [3, 3])
                    .with_stride([stride, stride])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .with_groups(in_channels)
                    .init(device),
                pointwise: Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device),
            });
            in_channels = out_channels;
        }

        Backbone {
            stem: Conv2dConfig::new([CHANNELS, self.stem_channels], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            blocks,
            head: Conv2dConfig::new([self.last_stage_channels(), self.embedding_dim], [1, 1])
                .init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    /// 事前学習済みの重みを読み込んでバックボーンを初期化
    ///
    /// レコードは `NamedMpkFileRecorder`（f32）形式で、パラメータ名と形状が
    /// この設定と一致している必要があります。
    pub fn init_pretrained<B: Backend>(&self, path: &Path, device: &B::Device) -> crate::Result<Backbone<B>> {
        let fresh = self.init::<B>(device);
        let loaded = fresh
            .clone()
            .load_file(
                path,
                &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                device,
            )
            .map_err(|e| {
                Error::LoadMismatch(format!(
                    "pretrained backbone {}: {e}",
                    path.display()
                ))
            })?;

        ensure_same_shapes::<B, _>(&fresh, &loaded, &format!("pretrained backbone {}", path.display()))?;
        Ok(loaded)
    }

    /// 推論グラフのノード列
    pub fn graph(&self, prefix: &str) -> Vec<GraphNode> {
        let mut nodes = vec![
            GraphNode::new(
                format!("{prefix}.stem"),
                GraphOp::Conv2d {
                    in_channels: CHANNELS,
                    out_channels: self.stem_channels,
                    kernel: 3,
                    stride: 2,
                    padding: 1,
                    groups: 1,
                },
            ),
            GraphNode::new(format!("{prefix}.stem_act"), GraphOp::Silu),
        ];

        let mut in_channels = self.stem_channels;
        for (i, (&out_channels, &stride)) in self
            .stage_channels
            .iter()
            .zip(&self.stage_strides)
            .enumerate()
        {
            nodes.push(GraphNode::new(
                format!("{prefix}.blocks.{i}.depthwise"),
                GraphOp::Conv2d {
                    in_channels,
                    out_channels: in_channels,
                    kernel: 3,
                    stride,
                    padding: 1,
                    groups: in_channels,
                },
            ));
            nodes.push(GraphNode::new(format!("{prefix}.blocks.{i}.act"), GraphOp::Silu));
            nodes.push(GraphNode::new(
                format!("{prefix}.blocks.{i}.pointwise"),
                GraphOp::Conv2d {
                    in_channels,
                    out_channels,
                    kernel: 1,
                    stride: 1,
                    padding: 0,
                    groups: 1,
                },
            ));
            if stride == 1 && in_channels == out_channels {
                nodes.push(GraphNode::new(format!("{prefix}.blocks.{i}.residual"), GraphOp::Add));
            }
            in_channels = out_channels;
        }

        nodes.push(GraphNode::new(
            format!("{prefix}.head"),
            GraphOp::Conv2d {
                in_channels,
                out_channels: self.embedding_dim,
                kernel: 1,
                stride: 1,
                padding: 0,
                groups: 1,
            },
        ));
        nodes.push(GraphNode::new(format!("{prefix}.head_act"), GraphOp::Silu));
        nodes.push(GraphNode::new(format!("{prefix}.pool"), GraphOp::GlobalAvgPool));
        nodes
    }
}

/// 深さ方向畳み込み + 点畳み込み
///
/// 入出力の形状が同じ場合は残差接続を加えます。
#[derive(Module, Debug)]
pub struct SeparableBlock<B: Backend> {
    depthwise: Conv2d<B>, // 3x3, groups = in
    pointwise: Conv2d<B>, // 1x1
}

impl<B: Backend> SeparableBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.depthwise.forward(input.clone());
        let x = silu(x);
        let x = self.pointwise.forward(x);

        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// 埋め込みバックボーン
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: Conv2d<B>,              // 3 -> stem, stride 2
    blocks: Vec<SeparableBlock<B>>,
    head: Conv2d<B>,              // last -> embedding_dim
    pool: AdaptiveAvgPool2d,      // -> 1x1
}

impl<B: Backend> Backbone<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, H, W]
    ///
    /// # 戻り値
    /// - 埋め込み [batch_size, embedding_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let mut x = silu(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = silu(self.head.forward(x));
        let x = self.pool.forward(x);

        let [_, c, _, _] = x.dims();
        x.reshape([batch_size, c])
    }
}
