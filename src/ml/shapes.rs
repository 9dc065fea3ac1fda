//! パラメータ形状の照合
//!
//! burn のレコード読み込みはテンソルの形状を検証しないため、読み込み後に
//! 同じ設定から初期化したモジュールと全パラメータの形状を突き合わせます。

use burn::{
    module::{Module, ModuleVisitor, Param},
    tensor::{backend::Backend, Tensor},
};

use crate::error::{Error, Result};

/// パラメータのパス（`backbone.blocks.0.depthwise.weight` など）と形状
pub type ParamShapes = Vec<(String, Vec<usize>)>;

#[derive(Default)]
struct ShapeCollector {
    path: Vec<String>,
    shapes: ParamShapes,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        // 遅延初期化のパラメータを実体化しない
        self.shapes
            .push((self.path.join("."), param.lazy_shape().dims));
    }

    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name.to_string());
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }
}

/// モジュール内の全浮動小数点パラメータの形状を訪問順に列挙
pub fn param_shapes<B: Backend, M: Module<B>>(module: &M) -> ParamShapes {
    let mut collector = ShapeCollector::default();
    module.visit(&mut collector);
    collector.shapes
}

/// 2つのモジュールのパラメータ構造が一致することを確認
///
/// 件数・パス・形状のいずれかが異なれば `LoadMismatch`。
pub fn ensure_same_shapes<B: Backend, M: Module<B>>(
    expected: &M,
    found: &M,
    source: &str,
) -> Result<()> {
    let expected = param_shapes::<B, M>(expected);
    let found = param_shapes::<B, M>(found);

    if expected.len() != found.len() {
        return Err(Error::LoadMismatch(format!(
            "{source}: expected {} parameter tensors, found {}",
            expected.len(),
            found.len()
        )));
    }

    for ((name, want), (found_name, got)) in expected.iter().zip(&found) {
        if name != found_name || want != got {
            return Err(Error::LoadMismatch(format!(
                "{source}: parameter {name} expected shape {want:?}, found {found_name} {got:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[derive(Module, Debug)]
    struct TwoLayers<B: Backend> {
        layers: Vec<Linear<B>>,
    }

    fn two_layers(widths: [usize; 3]) -> TwoLayers<TestBackend> {
        let device = Default::default();
        TwoLayers {
            layers: vec![
                LinearConfig::new(widths[0], widths[1]).init(&device),
                LinearConfig::new(widths[1], widths[2]).init(&device),
            ],
        }
    }

    #[test]
    fn test_param_shapes_paths() {
        let shapes = param_shapes::<TestBackend, _>(&two_layers([3, 4, 2]));
        assert_eq!(
            shapes,
            vec![
                ("layers.0.weight".to_string(), vec![3, 4]),
                ("layers.0.bias".to_string(), vec![4]),
                ("layers.1.weight".to_string(), vec![4, 2]),
                ("layers.1.bias".to_string(), vec![2]),
            ]
        );
    }

    #[test]
    fn test_same_count_different_shapes_rejected() {
        // どちらも13パラメータ
        let a = two_layers([2, 3, 1]);
        let b = two_layers([1, 4, 1]);
        assert_eq!(a.num_params(), b.num_params());
        assert!(matches!(
            ensure_same_shapes::<TestBackend, _>(&a, &b, "test"),
            Err(Error::LoadMismatch(_))
        ));
        assert!(ensure_same_shapes::<TestBackend, _>(&a, &two_layers([2, 3, 1]), "test").is_ok());
    }
}
