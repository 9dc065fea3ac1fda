//! 画像前処理
//!
//! 学習と推論で同一の変換（リサイズ → RGB → [0,1] スケーリング → CHW 配置）を
//! 行うための純粋関数を提供します。乱数は一切使いません。

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// デフォルトの入力解像度
pub const IMAGE_SIZE: usize = 128;

/// チャネル数（RGB）
pub const CHANNELS: usize = 3;

/// 固定解像度へのリサイズとテンソル化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTransform {
    pub width: usize,
    pub height: usize,
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self::new(IMAGE_SIZE, IMAGE_SIZE)
    }
}

impl ImageTransform {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// 1枚分の要素数 (3 * H * W)
    pub fn num_values(&self) -> usize {
        CHANNELS * self.width * self.height
    }

    /// テンソル形状 [3, H, W]
    pub fn shape(&self) -> [usize; 3] {
        [CHANNELS, self.height, self.width]
    }

    /// 画像を変換
    ///
    /// # 戻り値
    /// - [0,1] に正規化された RGB 値を (C, H, W) の順で平坦化したもの
    pub fn apply(&self, image: &DynamicImage) -> Vec<f32> {
        // torchvision の Resize と同じくバイリニア補間
        let resized = image
            .resize_exact(self.width as u32, self.height as u32, FilterType::Triangle)
            .to_rgb8();

        let plane = self.width * self.height;
        let mut data = vec![0.0f32; CHANNELS * plane];

        for (x, y, pixel) in resized.enumerate_pixels() {
            let offset = y as usize * self.width + x as usize;
            for channel in 0..CHANNELS {
                data[channel * plane + offset] = pixel[channel] as f32 / 255.0;
            }
        }

        data
    }

    /// 画像ファイルを読み込んで変換
    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let image = image::open(path).map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.apply(&image))
    }

    /// 変換済みデータを [1, 3, H, W] のテンソルにする
    pub fn to_tensor<B: Backend>(&self, values: Vec<f32>, device: &B::Device) -> Result<Tensor<B, 4>> {
        if values.len() != self.num_values() {
            return Err(Error::ShapeMismatch {
                stage: "preprocess",
                expected: self.shape().to_vec(),
                actual: vec![values.len()],
            });
        }
        Ok(Tensor::from_data(
            TensorData::new(values, [1, CHANNELS, self.height, self.width]),
            device,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    fn gradient_image(width: u32, height: u32) -> DynamicImage {
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        });
        DynamicImage::ImageRgb8(image)
    }

    #[test]
    fn test_output_shape_and_range() {
        let transform = ImageTransform::new(32, 24);
        let data = transform.apply(&gradient_image(97, 61));

        assert_eq!(data.len(), 3 * 32 * 24);
        assert!(data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_deterministic() {
        let transform = ImageTransform::default();
        let image = gradient_image(200, 150);

        assert_eq!(transform.apply(&image), transform.apply(&image));
    }

    #[test]
    fn test_channel_major_layout() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 0, 51])));
        let transform = ImageTransform::new(4, 4);
        let data = transform.apply(&image);

        let plane = 16;
        assert!(data[..plane].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(data[plane..2 * plane].iter().all(|v| v.abs() < 1e-6));
        assert!(data[2 * plane..].iter().all(|v| (*v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_to_tensor_rejects_wrong_length() {
        let transform = ImageTransform::new(8, 8);
        let device = Default::default();

        let tensor = transform
            .to_tensor::<TestBackend>(vec![0.5; 3 * 64], &device)
            .unwrap();
        assert_eq!(tensor.dims(), [1, 3, 8, 8]);

        let err = transform.to_tensor::<TestBackend>(vec![0.5; 10], &device);
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }
}
