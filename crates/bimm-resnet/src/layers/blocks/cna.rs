//! # `CNA2d` - conv/norm/activation block.
//!
//! A [`CNA2d`] module is:
//! * a [`Conv2d`] layer,
//! * a [`Normalization`] layer,
//! * a [`Relu`] activation.
//!
//! With support for hooking the forward method,
//! to run code between the norm and activation layers;
//! residual blocks use the hook to merge their shortcut.

use crate::compat::named_tensors::{NamedTensorMapper, NamedTensorVisitor, NamedTensors};
use crate::compat::normalization_wrapper::{Normalization, NormalizationConfig};
use crate::errors::ResNetResult;
use crate::layers::conv::conv_output_resolution;
use bimm_contracts::{assert_shape_contract_periodically, unpack_shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::Relu;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::{Backend, Tensor};

/// [`CNA2d`] Meta.
pub trait CNA2dMeta {
    /// Number of input channels.
    fn in_channels(&self) -> usize;

    /// Number of groups.
    fn groups(&self) -> usize;

    /// Number of output channels.
    fn out_channels(&self) -> usize;

    /// Get the stride.
    fn stride(&self) -> [usize; 2];

    /// Get the dilation.
    fn dilation(&self) -> [usize; 2];
}

/// [`CNA2d`] Config.
///
/// Implements [`CNA2dMeta`].
#[derive(Config, Debug)]
pub struct CNA2dConfig {
    /// The [`Conv2d`] config.
    pub conv: Conv2dConfig,

    /// The [`Normalization`] config.
    ///
    /// Resized to the conv output channels on init.
    #[config(default = "NormalizationConfig::default()")]
    pub norm: NormalizationConfig,
}

impl CNA2dMeta for CNA2dConfig {
    fn in_channels(&self) -> usize {
        self.conv.channels[0]
    }

    fn groups(&self) -> usize {
        self.conv.groups
    }

    fn out_channels(&self) -> usize {
        self.conv.channels[1]
    }

    fn stride(&self) -> [usize; 2] {
        self.conv.stride
    }

    fn dilation(&self) -> [usize; 2] {
        self.conv.dilation
    }
}

impl CNA2dConfig {
    /// Initialize a [`CNA2d`].
    ///
    /// Auto-matches the norm layer features
    /// to the conv layer's output channels.
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> CNA2d<B> {
        let cfg = self.match_norm_features();
        CNA2d {
            conv: cfg.conv.init(device),
            norm: cfg.norm.init(device),
            act: Relu::new(),
        }
    }

    /// Check that the norm fits the conv output channels.
    pub fn try_validate(&self) -> ResNetResult<()> {
        self.norm.clone().try_with_num_features(self.out_channels())?;
        Ok(())
    }

    /// Adjust the norm features to match the conv output size.
    ///
    /// [`CNA2dConfig::init`] does this automatically.
    pub fn match_norm_features(self) -> Self {
        let features = self.out_channels();
        let norm = self.norm.with_num_features(features);
        Self { norm, ..self }
    }

    /// Output resolution for an input resolution.
    pub fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        conv_output_resolution(&self.conv, input_resolution)
    }
}

/// Sequenced conv/norm/``ReLU`` block.
///
/// Implements [`CNA2dMeta`].
#[derive(Module, Debug)]
pub struct CNA2d<B: Backend> {
    /// Internal Conv2d layer.
    pub conv: Conv2d<B>,

    /// Internal Norm Layer.
    pub norm: Normalization<B>,

    /// Activation layer.
    pub act: Relu,
}

impl<B: Backend> CNA2dMeta for CNA2d<B> {
    fn in_channels(&self) -> usize {
        self.conv.weight.shape().dims[1] * self.groups()
    }

    fn groups(&self) -> usize {
        self.conv.groups
    }

    fn out_channels(&self) -> usize {
        self.conv.weight.shape().dims[0]
    }

    fn stride(&self) -> [usize; 2] {
        self.conv.stride
    }

    fn dilation(&self) -> [usize; 2] {
        self.conv.dilation
    }
}

impl<B: Backend> CNA2d<B> {
    /// Forward Pass.
    ///
    /// ```rust,ignore
    /// let x = self.conv.forward(input);
    /// let x = self.norm.forward(x);
    /// let x = self.act.forward(x);
    /// ```
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// ``[batch, out_channels, out_height, out_width]``
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        self.hook_forward(input, |x| x)
    }

    /// Hooked Forward Pass.
    ///
    /// Applies the hook after normalization but before activation.
    ///
    /// ```rust,ignore
    /// let x = self.conv.forward(input);
    /// let x = self.norm.forward(x);
    /// let x = hook(x);
    /// let x = self.act.forward(x);
    /// ```
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// ``[batch, out_channels, out_height, out_width]``
    pub fn hook_forward<F>(
        &self,
        input: Tensor<B, 4>,
        hook: F,
    ) -> Tensor<B, 4>
    where
        F: FnOnce(Tensor<B, 4>) -> Tensor<B, 4>,
    {
        let [batch] = unpack_shape_contract!(
            ["batch", "in_channels", "in_height", "in_width"],
            &input,
            &["batch"],
            &[("in_channels", self.in_channels())]
        );

        let x = self.conv.forward(input);
        let [out_height, out_width] = unpack_shape_contract!(
            ["batch", "out_channels", "out_height", "out_width"],
            &x,
            &["out_height", "out_width"],
            &[("batch", batch), ("out_channels", self.out_channels())]
        );

        let x = self.norm.forward(x);
        let x = hook(x);
        let x = self.act.forward(x);

        assert_shape_contract_periodically!(
            ["batch", "out_channels", "out_height", "out_width"],
            &x,
            &[
                ("batch", batch),
                ("out_channels", self.out_channels()),
                ("out_height", out_height),
                ("out_width", out_width)
            ]
        );

        x
    }

    /// Visit the conv and norm tensors under independent paths.
    ///
    /// ``torchvision`` names the pair as siblings (``conv1``, ``bn1``).
    pub fn visit_named_pair<V: NamedTensorVisitor<B>>(
        &self,
        conv_path: &str,
        norm_path: &str,
        visitor: &mut V,
    ) {
        self.conv.visit_named(conv_path, visitor);
        self.norm.visit_named(norm_path, visitor);
    }

    /// Map the conv and norm tensors under independent paths.
    ///
    /// See [`CNA2d::visit_named_pair`].
    pub fn map_named_pair<M: NamedTensorMapper<B>>(
        mut self,
        conv_path: &str,
        norm_path: &str,
        mapper: &mut M,
    ) -> Self {
        self.conv = self.conv.map_named(conv_path, mapper);
        self.norm = self.norm.map_named(norm_path, mapper);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ResNetError;
    use crate::layers::conv::conv3x3;
    use bimm_contracts::assert_shape_contract;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::GroupNormConfig;
    use burn::tensor::Distribution;

    #[test]
    fn test_cna_config() {
        let config = CNA2dConfig::new(conv3x3(2, 4, 2, 1, 1).unwrap());

        assert_eq!(config.in_channels(), 2);
        assert_eq!(config.out_channels(), 4);
        assert_eq!(config.groups(), 1);
        assert_eq!(config.stride(), [2, 2]);
        assert_eq!(config.dilation(), [1, 1]);
        assert_eq!(config.output_resolution([10, 11]), [5, 6]);

        let config = config.match_norm_features();
        assert_eq!(config.norm.num_features(), 4);
    }

    #[test]
    fn test_cna() {
        type B = Autodiff<NdArray<f32>>;
        let device = Default::default();

        let config = CNA2dConfig::new(conv3x3(2, 4, 2, 1, 1).unwrap())
            .with_norm(GroupNormConfig::new(2, 0).into());
        assert!(config.try_validate().is_ok());
        assert!(matches!(
            config.clone().with_norm(GroupNormConfig::new(3, 0).into()).try_validate(),
            Err(ResNetError::InvalidChannels(_))
        ));

        let layer: CNA2d<B> = config.init(&device);
        assert_eq!(layer.in_channels(), 2);
        assert_eq!(layer.out_channels(), 4);
        assert_eq!(layer.norm.num_features(), 4);
        assert_eq!(layer.stride(), [2, 2]);

        let input = Tensor::random([2, 2, 10, 10], Distribution::Default, &device);

        let output = layer.forward(input.clone());
        assert_shape_contract!(
            ["batch", "channels", "height", "width"],
            &output,
            &[("batch", 2), ("channels", 4), ("height", 5), ("width", 5)]
        );
        let expected = {
            let x = layer.conv.forward(input.clone());
            let x = layer.norm.forward(x);
            layer.act.forward(x)
        };
        output.to_data().assert_eq(&expected.to_data(), true);

        let hook = |x: Tensor<B, 4>| x * 2.0 - 1.0;
        let output = layer.hook_forward(input.clone(), hook);
        let expected = {
            let x = layer.conv.forward(input.clone());
            let x = layer.norm.forward(x);
            let x = hook(x);
            layer.act.forward(x)
        };
        output.to_data().assert_eq(&expected.to_data(), true);
    }

    #[test]
    fn test_named_pair() {
        type B = NdArray<f32>;
        let device = Default::default();

        let layer: CNA2d<B> = CNA2dConfig::new(conv3x3(2, 4, 1, 1, 1).unwrap()).init(&device);

        let mut weights = crate::registry::weights::WeightMap::new();
        struct Collect<'a>(&'a mut crate::registry::weights::WeightMap);
        impl<K: Backend> NamedTensorVisitor<K> for Collect<'_> {
            fn visit<const D: usize>(
                &mut self,
                path: &str,
                tensor: Tensor<K, D>,
            ) {
                self.0.insert(path.to_string(), tensor.into_data());
            }
        }
        layer.visit_named_pair("layer1.0.conv1", "layer1.0.bn1", &mut Collect(&mut weights));

        assert_eq!(
            weights.keys().cloned().collect::<Vec<_>>(),
            vec![
                "layer1.0.bn1.bias",
                "layer1.0.bn1.running_mean",
                "layer1.0.bn1.running_var",
                "layer1.0.bn1.weight",
                "layer1.0.conv1.weight",
            ]
        );
        assert_eq!(weights["layer1.0.conv1.weight"].shape, vec![4, 2, 3, 3]);
    }
}
