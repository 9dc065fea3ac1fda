//! ジェスチャー分類モデル
//!
//! 埋め込みバックボーン + 線形ヘッドでクラスごとのロジットを出力します。
//! ソフトマックスは損失計算と推論結果の整形でのみ適用します。

use burn::{
    config::Config,
    module::Module,
    nn::{loss::CrossEntropyLossConfig, Dropout, DropoutConfig, Linear, LinearConfig},
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::error::Error;
use crate::ml::backbone::{Backbone, BackboneConfig};
use crate::ml::export::{GraphNode, GraphOp};
use crate::ml::preprocess::{ImageTransform, CHANNELS};
use crate::ml::shapes::ensure_same_shapes;

/// モデル設定
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像の幅
    #[config(default = 128)]
    pub image_width: usize,
    /// 入力画像の高さ
    #[config(default = 128)]
    pub image_height: usize,
    /// 埋め込みバックボーン
    #[config(default = "BackboneConfig::new()")]
    pub backbone: BackboneConfig,
    /// ヘッド直前のドロップアウト率（学習時のみ有効）
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl ClassifierConfig {
    /// 入力解像度に対応する前処理
    pub fn transform(&self) -> ImageTransform {
        ImageTransform::new(self.image_width, self.image_height)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Data("classifier needs at least one class".to_string()));
        }
        if self.image_width == 0 || self.image_height == 0 {
            return Err(Error::Data(format!(
                "invalid input size {}x{}",
                self.image_width, self.image_height
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Data(format!("dropout {} must be in [0, 1)", self.dropout)));
        }
        self.backbone.validate()
    }

    /// 同じ構造を表す設定か
    pub fn same_architecture(&self, other: &Self) -> bool {
        // Config は PartialEq を持たないため、シリアライズ結果で比較
        match (serde_json::to_value(self), serde_json::to_value(other)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// モデルを初期化（ランダム重み）
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        self.init_with_backbone(self.backbone.init(device), device)
    }

    /// 既存のバックボーン（事前学習済みなど）を使ってモデルを初期化
    pub fn init_with_backbone<B: Backend>(
        &self,
        backbone: Backbone<B>,
        device: &B::Device,
    ) -> Classifier<B> {
        Classifier {
            backbone,
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(self.backbone.embedding_dim, self.num_classes).init(device),
            image_width: self.image_width,
            image_height: self.image_height,
        }
    }

    /// 保存済みの重みを読み込んでモデルを構築
    ///
    /// 名前付きレコードのキーと形状がこの設定から作ったモデルと一致しない場合は
    /// `LoadMismatch` になります。
    pub fn load_bytes<B: Backend>(&self, bytes: Vec<u8>, device: &B::Device) -> crate::Result<Classifier<B>> {
        let record = NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
            .load(bytes, device)
            .map_err(|e| Error::LoadMismatch(format!("{e:?}")))?;
        let model = self.init::<B>(device).load_record(record);

        self.ensure_matches(&model)?;
        Ok(model)
    }

    /// モデルのパラメータ形状がこの設定から作ったものと一致するか確認
    pub fn ensure_matches<B: Backend>(&self, model: &Classifier<B>) -> crate::Result<()> {
        let device = model
            .devices()
            .into_iter()
            .next()
            .unwrap_or_default();
        let reference = self.init::<B>(&device);
        ensure_same_shapes::<B, _>(&reference, model, "classifier weights")
    }

    /// 計算グラフ（学習時の構成）
    ///
    /// 推論時はドロップアウトが恒等写像になるため、エクスポート前に除去されます。
    pub fn graph(&self) -> Vec<GraphNode> {
        let mut nodes = self.backbone.graph("backbone");
        nodes.push(GraphNode::new("flatten".to_string(), GraphOp::Flatten));
        if self.dropout > 0.0 {
            nodes.push(GraphNode::new(
                "dropout".to_string(),
                GraphOp::Dropout { prob: self.dropout },
            ));
        }
        nodes.push(GraphNode::new(
            "head".to_string(),
            GraphOp::Linear {
                in_features: self.backbone.embedding_dim,
                out_features: self.num_classes,
            },
        ));
        nodes
    }
}

/// ジェスチャー分類モデル
///
/// # アーキテクチャ
/// - バックボーン: 画像 -> 埋め込み [B, embedding_dim]
/// - Flatten
/// - Dropout（学習時のみ）
/// - FC: embedding_dim -> num_classes
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    backbone: Backbone<B>,
    dropout: Dropout,
    head: Linear<B>,
    image_width: usize,
    image_height: usize,
}

impl<B: Backend> Classifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, H, W]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> crate::Result<Tensor<B, 2>> {
        let [batch_size, channels, height, width] = images.dims();
        if channels != CHANNELS || height != self.image_height || width != self.image_width {
            return Err(Error::ShapeMismatch {
                stage: "classifier input",
                expected: vec![batch_size, CHANNELS, self.image_height, self.image_width],
                actual: vec![batch_size, channels, height, width],
            });
        }

        let x = self.backbone.forward(images);

        // Flatten（埋め込みはすでに [B, D]）
        let [_, d] = x.dims();
        let x = x.reshape([batch_size, d]);

        let x = self.dropout.forward(x);
        Ok(self.head.forward(x))
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - 各サンプルのクラス確率（ソフトマックス後） [batch_size, num_classes]
    pub fn predict(&self, images: Tensor<B, 4>) -> crate::Result<Tensor<B, 2>> {
        Ok(softmax(self.forward(images)?, 1))
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, H, W]
    /// - `targets`: ターゲットラベル [batch_size]
    ///
    /// # 戻り値
    /// - ClassificationOutput（損失、出力、ターゲット）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> crate::Result<ClassificationOutput<B>> {
        let [batch_size, _, _, _] = images.dims();
        let [num_targets] = targets.dims();
        if num_targets != batch_size {
            return Err(Error::ShapeMismatch {
                stage: "classifier targets",
                expected: vec![batch_size],
                actual: vec![num_targets],
            });
        }

        let output = self.forward(images)?;
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        Ok(ClassificationOutput::new(loss, output, targets))
    }

    /// バックボーンの勾配計算を止める（ヘッドのみ学習）
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.no_grad();
        self
    }

    /// 入力解像度 (幅, 高さ)
    pub fn input_size(&self) -> (usize, usize) {
        (self.image_width, self.image_height)
    }

    /// 重みを名前付きレコードのバイト列にする
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
            .record(self.clone().into_record(), ())
            .map_err(|e| Error::Record(format!("{e:?}")))
    }
}

/// 確率/ロジット行列の各行の最大要素のインデックス
///
/// 同値の場合は小さいインデックスを返します。
pub fn argmax_rows(values: &[f32], num_classes: usize) -> Vec<usize> {
    values
        .chunks(num_classes.max(1))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, &v)| {
                    if v > best_value {
                        (i, v)
                    } else {
                        (best, best_value)
                    }
                })
                .0
        })
        .collect()
}
