//! バッチ化
//!
//! - `BatchSampler`: サンプル順序の決定（エポックごとのシャッフル）
//! - `BatchLoader`: 1バッチ分の画像を並列に読み込み（順序は保持）
//! - `GestureBatcher`: 前処理済みサンプルをテンソルにまとめる

use burn::data::dataloader::batcher::Batcher;
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::ml::dataset::{GestureDataset, Sample};
use crate::ml::preprocess::{ImageTransform, CHANNELS};

/// サンプルインデックスを固定サイズのバッチに分割
///
/// 最後のバッチは端数になることがあります。
#[derive(Debug, Clone, Copy)]
pub struct BatchSampler {
    num_samples: usize,
    batch_size: usize,
    shuffle: bool,
}

impl BatchSampler {
    pub fn new(num_samples: usize, batch_size: usize, shuffle: bool) -> Self {
        Self {
            num_samples,
            batch_size: batch_size.max(1),
            shuffle,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.num_samples.div_ceil(self.batch_size)
    }

    /// 1パス分のバッチ列を生成
    ///
    /// シャッフルは呼び出し側の乱数生成器のみを使うため、シードが同じなら
    /// 同じバッチ構成になります。
    pub fn batches(&self, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.num_samples).collect();
        if self.shuffle {
            indices.shuffle(rng);
        }
        indices
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

/// バッチ単位の画像読み込み
///
/// `num_workers` が0の場合は呼び出しスレッドで順に読み込みます。
pub struct BatchLoader {
    pool: Option<rayon::ThreadPool>,
}

impl BatchLoader {
    pub fn new(num_workers: usize) -> Result<Self> {
        let pool = if num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_workers)
                .thread_name(|i| format!("batch-loader-{i}"))
                .build()
                .map_err(|e| Error::Data(format!("failed to start loader threads: {e}")))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self { pool })
    }

    /// インデックス順を保ったままサンプルを読み込む
    ///
    /// 1枚でも失敗すればバッチ全体がエラーになります。
    pub fn load(&self, dataset: &GestureDataset, indices: &[usize]) -> Result<Vec<Sample>> {
        match &self.pool {
            Some(pool) => pool.install(|| {
                indices
                    .par_iter()
                    .map(|&index| dataset.get(index))
                    .collect::<Result<Vec<_>>>()
            }),
            None => indices.iter().map(|&index| dataset.get(index)).collect(),
        }
    }
}

/// バッチャー
#[derive(Clone)]
pub struct GestureBatcher<B: Backend> {
    device: B::Device,
    transform: ImageTransform,
}

impl<B: Backend> GestureBatcher<B> {
    pub fn new(device: B::Device, transform: ImageTransform) -> Self {
        Self { device, transform }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct GestureBatch<B: Backend> {
    /// [batch_size, 3, H, W]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> GestureBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.targets.dims()[0]
    }
}

impl<B: Backend> Batcher<B, Sample, GestureBatch<B>> for GestureBatcher<B> {
    fn batch(&self, items: Vec<Sample>, _device: &B::Device) -> GestureBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * self.transform.num_values());
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            debug_assert_eq!(item.pixels.len(), self.transform.num_values());
            all_pixels.extend_from_slice(&item.pixels);
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device).reshape([
            batch_size,
            CHANNELS,
            self.transform.height,
            self.transform.width,
        ]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        GestureBatch { images, targets }
    }
}

impl<B: Backend> GestureBatcher<B> {
    /// 読み込み済みサンプルの形状を検証してからバッチ化
    pub fn checked_batch(&self, items: Vec<Sample>) -> Result<GestureBatch<B>> {
        if let Some(item) = items
            .iter()
            .find(|item| item.pixels.len() != self.transform.num_values())
        {
            return Err(Error::ShapeMismatch {
                stage: "batcher",
                expected: self.transform.shape().to_vec(),
                actual: vec![item.pixels.len()],
            });
        }
        Ok(self.batch(items, &self.device))
    }
}
