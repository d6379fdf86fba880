//! # Named Tensor Paths
//!
//! Exposes the parameters and running statistics of a module under
//! dotted ``torchvision``-style paths (``layer1.0.bn1.running_mean``),
//! so that pretrained weight maps can be exported and applied by exact name.
//!
//! Layer conventions:
//! * [`Conv2d`] - ``weight``, ``bias``.
//! * [`Linear`] - ``weight`` as ``[d_output, d_input]``, ``bias``.
//! * norm layers - ``weight`` (scale), ``bias``; and for batch norm
//!   ``running_mean`` / ``running_var``.

use crate::compat::normalization_wrapper::Normalization;
use crate::errors::{ResNetError, ResNetResult};
use crate::registry::weights::WeightMap;
use burn::module::RunningState;
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, GroupNorm, InstanceNorm, Linear};
use burn::prelude::{Backend, Tensor};
use burn::tensor::TensorData;
use std::collections::BTreeMap;

/// Key suffixes which name counters rather than tensors, and are never loaded.
pub const IGNORED_KEY_SUFFIXES: [&str; 1] = ["num_batches_tracked"];

/// Join a dotted path prefix and a name.
pub fn join_path(
    prefix: &str,
    name: &str,
) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Is the key a counter which is never loaded?
pub fn is_ignored_key(key: &str) -> bool {
    IGNORED_KEY_SUFFIXES
        .iter()
        .any(|suffix| key == *suffix || key.ends_with(&format!(".{suffix}")))
}

/// Read-only visitor over named tensors.
pub trait NamedTensorVisitor<B: Backend> {
    /// Visit the tensor at ``path``.
    fn visit<const D: usize>(
        &mut self,
        path: &str,
        tensor: Tensor<B, D>,
    );
}

/// Replacing visitor over named tensors.
pub trait NamedTensorMapper<B: Backend> {
    /// Map the tensor at ``path``.
    ///
    /// Must return a tensor of the same shape.
    fn map<const D: usize>(
        &mut self,
        path: &str,
        tensor: Tensor<B, D>,
    ) -> Tensor<B, D>;
}

/// A module which exposes its tensors under dotted paths.
pub trait NamedTensors<B: Backend>: Sized {
    /// Visit every named tensor, in a stable order.
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    );

    /// Map every named tensor, in the same order as [`NamedTensors::visit_named`].
    fn map_named<M: NamedTensorMapper<B>>(
        self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self;

    /// Export every named tensor.
    fn to_weight_map(&self) -> WeightMap {
        let mut collector = WeightMapCollector::default();
        self.visit_named("", &mut collector);
        collector.weights
    }

    /// The shape of every named tensor.
    fn named_shapes(&self) -> BTreeMap<String, Vec<usize>> {
        let mut collector = ShapeCollector::default();
        self.visit_named("", &mut collector);
        collector.shapes
    }

    /// Apply a weight map, all-or-nothing.
    ///
    /// The map must name exactly the tensors of the module, with matching shapes;
    /// entries named by [`IGNORED_KEY_SUFFIXES`] are skipped.
    ///
    /// # Returns
    ///
    /// The updated module; or [`ResNetError::WeightMismatch`], and nothing applied.
    fn load_weight_map(
        self,
        weights: &WeightMap,
    ) -> ResNetResult<Self> {
        check_weight_map(&self.named_shapes(), weights)?;
        let mut loader = WeightMapLoader { weights };
        Ok(self.map_named("", &mut loader))
    }
}

/// Compare a weight map against the expected shapes.
///
/// # Returns
///
/// `Ok(())` on an exact match; or [`ResNetError::WeightMismatch`].
pub fn check_weight_map(
    expected: &BTreeMap<String, Vec<usize>>,
    weights: &WeightMap,
) -> ResNetResult<()> {
    let mut missing = Vec::new();
    let mut mismatched = Vec::new();
    for (path, shape) in expected {
        match weights.get(path) {
            None => missing.push(path.clone()),
            Some(data) if &data.shape != shape => mismatched.push(format!(
                "{path}: expected {shape:?}, got {:?}",
                data.shape
            )),
            Some(_) => {}
        }
    }
    let unexpected: Vec<String> = weights
        .keys()
        .filter(|key| !expected.contains_key(*key) && !is_ignored_key(key))
        .cloned()
        .collect();

    if missing.is_empty() && unexpected.is_empty() && mismatched.is_empty() {
        Ok(())
    } else {
        Err(ResNetError::WeightMismatch {
            missing,
            unexpected,
            mismatched,
        })
    }
}

#[derive(Default)]
struct WeightMapCollector {
    weights: WeightMap,
}

impl<B: Backend> NamedTensorVisitor<B> for WeightMapCollector {
    fn visit<const D: usize>(
        &mut self,
        path: &str,
        tensor: Tensor<B, D>,
    ) {
        self.weights.insert(path.to_string(), tensor.into_data());
    }
}

#[derive(Default)]
struct ShapeCollector {
    shapes: BTreeMap<String, Vec<usize>>,
}

impl<B: Backend> NamedTensorVisitor<B> for ShapeCollector {
    fn visit<const D: usize>(
        &mut self,
        path: &str,
        tensor: Tensor<B, D>,
    ) {
        self.shapes.insert(path.to_string(), tensor.shape().dims.to_vec());
    }
}

struct WeightMapLoader<'a> {
    weights: &'a WeightMap,
}

impl<B: Backend> NamedTensorMapper<B> for WeightMapLoader<'_> {
    fn map<const D: usize>(
        &mut self,
        path: &str,
        tensor: Tensor<B, D>,
    ) -> Tensor<B, D> {
        match self.weights.get(path) {
            Some(data) => {
                let data: TensorData = data.clone().convert::<B::FloatElem>();
                Tensor::from_data(data, &tensor.device())
            }
            None => tensor,
        }
    }
}

impl<B: Backend> NamedTensors<B> for Conv2d<B> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        visitor.visit(&join_path(prefix, "weight"), self.weight.val());
        if let Some(bias) = &self.bias {
            visitor.visit(&join_path(prefix, "bias"), bias.val());
        }
    }

    fn map_named<M: NamedTensorMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self {
        self.weight = self
            .weight
            .map(|t| mapper.map(&join_path(prefix, "weight"), t));
        self.bias = self
            .bias
            .map(|bias| bias.map(|t| mapper.map(&join_path(prefix, "bias"), t)));
        self
    }
}

impl<B: Backend> NamedTensors<B> for Linear<B> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        visitor.visit(&join_path(prefix, "weight"), self.weight.val().transpose());
        if let Some(bias) = &self.bias {
            visitor.visit(&join_path(prefix, "bias"), bias.val());
        }
    }

    fn map_named<M: NamedTensorMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self {
        self.weight = self.weight.map(|t| {
            mapper
                .map(&join_path(prefix, "weight"), t.transpose())
                .transpose()
        });
        self.bias = self
            .bias
            .map(|bias| bias.map(|t| mapper.map(&join_path(prefix, "bias"), t)));
        self
    }
}

impl<B: Backend> NamedTensors<B> for BatchNorm<B, 2> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        visitor.visit(&join_path(prefix, "weight"), self.gamma.val());
        visitor.visit(&join_path(prefix, "bias"), self.beta.val());
        visitor.visit(
            &join_path(prefix, "running_mean"),
            self.running_mean.value(),
        );
        visitor.visit(&join_path(prefix, "running_var"), self.running_var.value());
    }

    fn map_named<M: NamedTensorMapper<B>>(
        mut self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self {
        self.gamma = self
            .gamma
            .map(|t| mapper.map(&join_path(prefix, "weight"), t));
        self.beta = self.beta.map(|t| mapper.map(&join_path(prefix, "bias"), t));
        self.running_mean = RunningState::new(mapper.map(
            &join_path(prefix, "running_mean"),
            self.running_mean.value(),
        ));
        self.running_var = RunningState::new(
            mapper.map(&join_path(prefix, "running_var"), self.running_var.value()),
        );
        self
    }
}

macro_rules! affine_norm_named_tensors {
    ($layer:ident) => {
        impl<B: Backend> NamedTensors<B> for $layer<B> {
            fn visit_named<V: NamedTensorVisitor<B>>(
                &self,
                prefix: &str,
                visitor: &mut V,
            ) {
                if let Some(gamma) = &self.gamma {
                    visitor.visit(&join_path(prefix, "weight"), gamma.val());
                }
                if let Some(beta) = &self.beta {
                    visitor.visit(&join_path(prefix, "bias"), beta.val());
                }
            }

            fn map_named<M: NamedTensorMapper<B>>(
                mut self,
                prefix: &str,
                mapper: &mut M,
            ) -> Self {
                self.gamma = self
                    .gamma
                    .map(|gamma| gamma.map(|t| mapper.map(&join_path(prefix, "weight"), t)));
                self.beta = self
                    .beta
                    .map(|beta| beta.map(|t| mapper.map(&join_path(prefix, "bias"), t)));
                self
            }
        }
    };
}

affine_norm_named_tensors!(GroupNorm);
affine_norm_named_tensors!(InstanceNorm);

impl<B: Backend> NamedTensors<B> for Normalization<B> {
    fn visit_named<V: NamedTensorVisitor<B>>(
        &self,
        prefix: &str,
        visitor: &mut V,
    ) {
        match self {
            Normalization::Batch(norm) => norm.visit_named(prefix, visitor),
            Normalization::Group(norm) => norm.visit_named(prefix, visitor),
            Normalization::Instance(norm) => norm.visit_named(prefix, visitor),
        }
    }

    fn map_named<M: NamedTensorMapper<B>>(
        self,
        prefix: &str,
        mapper: &mut M,
    ) -> Self {
        match self {
            Normalization::Batch(norm) => Normalization::Batch(norm.map_named(prefix, mapper)),
            Normalization::Group(norm) => Normalization::Group(norm.map_named(prefix, mapper)),
            Normalization::Instance(norm) => {
                Normalization::Instance(norm.map_named(prefix, mapper))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::conv::Conv2dConfig;
    use burn::nn::{BatchNormConfig, GroupNormConfig, LinearConfig};

    type B = NdArray<f32>;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "conv1"), "conv1");
        assert_eq!(join_path("layer1.0", "conv1"), "layer1.0.conv1");
    }

    #[test]
    fn test_is_ignored_key() {
        assert!(is_ignored_key("bn1.num_batches_tracked"));
        assert!(is_ignored_key("num_batches_tracked"));
        assert!(!is_ignored_key("bn1.running_mean"));
        assert!(!is_ignored_key("bn1.xnum_batches_tracked"));
    }

    #[test]
    fn test_conv_names() {
        let device = Default::default();
        let conv: Conv2d<B> = Conv2dConfig::new([3, 8], [3, 3])
            .with_bias(false)
            .init(&device);

        let shapes = conv.named_shapes();
        assert_eq!(shapes.len(), 1);
        assert_eq!(shapes["weight"], vec![8, 3, 3, 3]);
    }

    #[test]
    fn test_linear_uses_output_major_weight() {
        let device = Default::default();
        let linear: Linear<B> = LinearConfig::new(6, 4).init(&device);

        let shapes = linear.named_shapes();
        assert_eq!(shapes["weight"], vec![4, 6]);
        assert_eq!(shapes["bias"], vec![4]);

        let mut weights = linear.to_weight_map();
        let values: Vec<f32> = (0..24).map(|i| i as f32).collect();
        weights.insert("weight".to_string(), TensorData::new(values, [4, 6]));

        let linear = linear.load_weight_map(&weights).unwrap();
        let exported = linear.to_weight_map();
        exported["weight"].assert_eq(&weights["weight"], true);

        // burn stores ``[d_input, d_output]``.
        assert_eq!(linear.weight.dims(), [6, 4]);
        let raw = linear.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(&raw[..4], &[0.0, 6.0, 12.0, 18.0]);
    }

    #[test]
    fn test_batch_norm_round_trip() {
        let device = Default::default();
        let norm: BatchNorm<B, 2> = BatchNormConfig::new(3).init(&device);

        let shapes = norm.named_shapes();
        assert_eq!(
            shapes.keys().cloned().collect::<Vec<_>>(),
            vec!["bias", "running_mean", "running_var", "weight"]
        );

        let mut weights = WeightMap::new();
        weights.insert("weight".into(), TensorData::new(vec![1.0f32, 2.0, 3.0], [3]));
        weights.insert("bias".into(), TensorData::new(vec![0.5f32, 0.5, 0.5], [3]));
        weights.insert(
            "running_mean".into(),
            TensorData::new(vec![0.1f32, 0.2, 0.3], [3]),
        );
        weights.insert(
            "running_var".into(),
            TensorData::new(vec![2.0f32, 2.0, 2.0], [3]),
        );
        weights.insert(
            "num_batches_tracked".into(),
            TensorData::new(vec![7i64], [1]),
        );

        let norm = norm.load_weight_map(&weights).unwrap();
        let exported = norm.to_weight_map();
        assert_eq!(exported.len(), 4);
        for (key, data) in &exported {
            data.assert_eq(&weights[key], true);
        }
    }

    #[test]
    fn test_load_rejects_mismatch() {
        let device = Default::default();
        let norm: Normalization<B> = GroupNormConfig::new(2, 4).init(&device).into();

        let mut weights = norm.to_weight_map();
        weights.remove("bias");
        weights.insert("extra".into(), TensorData::new(vec![0.0f32], [1]));
        weights.insert("weight".into(), TensorData::new(vec![0.0f32; 5], [5]));

        match norm.load_weight_map(&weights) {
            Err(ResNetError::WeightMismatch {
                missing,
                unexpected,
                mismatched,
            }) => {
                assert_eq!(missing, vec!["bias".to_string()]);
                assert_eq!(unexpected, vec!["extra".to_string()]);
                assert_eq!(mismatched.len(), 1);
                assert!(mismatched[0].starts_with("weight:"));
            }
            other => panic!("Unexpected result: {other:?}"),
        }
    }
}
