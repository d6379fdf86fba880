//! # `ResNet` Named Presets
//!
//! The 9 published `ResNet` / `ResNeXt` / `Wide-ResNet` variants,
//! each with its pretrained weight descriptor.
//!
//! PreFab - a well known model config.
//! PreTrained - a preset hydrated by a [`WeightFetcher`].
//!
//! name 1:1 PreFab; PreFab 0:1 weights descriptor.

use crate::compat::named_tensors::NamedTensors;
use crate::compat::normalization_wrapper::NormalizationConfig;
use crate::errors::{ResNetError, ResNetResult};
use crate::models::resnet::resnet_model::{ResNet, ResNetConfig};
use crate::registry::weights::{
    PretrainedWeightsDescriptor, StaticPretrainedWeightsDescriptor, WeightFetcher,
};
use burn::module::Module;
use burn::prelude::Backend;
use serde::{Deserialize, Serialize};

const TORCHVISION_LICENSE: Option<&str> = Some("BSD-3-Clause");
const TORCHVISION_ORIGIN: Option<&str> = Some("https://github.com/pytorch/vision");

macro_rules! torchvision_weights {
    ($name:literal, $description:literal, $file:literal) => {
        StaticPretrainedWeightsDescriptor {
            name: $name,
            description: $description,
            license: TORCHVISION_LICENSE,
            origin: TORCHVISION_ORIGIN,
            urls: &[concat!("https://download.pytorch.org/models/", $file)],
        }
    };
}

/// `ResNet-18` pretrained on `ImageNet`.
pub static RESNET18_TORCHVISION: StaticPretrainedWeightsDescriptor = torchvision_weights!(
    "resnet18",
    "ResNet-18 pretrained on ImageNet",
    "resnet18-5c106cde.pth"
);

/// `ResNet-34` pretrained on `ImageNet`.
pub static RESNET34_TORCHVISION: StaticPretrainedWeightsDescriptor = torchvision_weights!(
    "resnet34",
    "ResNet-34 pretrained on ImageNet",
    "resnet34-333f7ec4.pth"
);

/// `ResNet-50` pretrained on `ImageNet`.
pub static RESNET50_TORCHVISION: StaticPretrainedWeightsDescriptor = torchvision_weights!(
    "resnet50",
    "ResNet-50 pretrained on ImageNet",
    "resnet50-19c8e357.pth"
);

/// `ResNet-101` pretrained on `ImageNet`.
pub static RESNET101_TORCHVISION: StaticPretrainedWeightsDescriptor = torchvision_weights!(
    "resnet101",
    "ResNet-101 pretrained on ImageNet",
    "resnet101-5d3b4d8f.pth"
);

/// `ResNet-152` pretrained on `ImageNet`.
pub static RESNET152_TORCHVISION: StaticPretrainedWeightsDescriptor = torchvision_weights!(
    "resnet152",
    "ResNet-152 pretrained on ImageNet",
    "resnet152-b121ed2d.pth"
);

/// `ResNeXt-50 32x4d` pretrained on `ImageNet`.
pub static RESNEXT50_32X4D_TORCHVISION: StaticPretrainedWeightsDescriptor = torchvision_weights!(
    "resnext50_32x4d",
    "ResNeXt-50 32x4d pretrained on ImageNet",
    "resnext50_32x4d-7cdf4587.pth"
);

/// `ResNeXt-101 32x8d` pretrained on `ImageNet`.
pub static RESNEXT101_32X8D_TORCHVISION: StaticPretrainedWeightsDescriptor = torchvision_weights!(
    "resnext101_32x8d",
    "ResNeXt-101 32x8d pretrained on ImageNet",
    "resnext101_32x8d-8ba56ff5.pth"
);

/// `Wide ResNet-50-2` pretrained on `ImageNet`.
pub static WIDE_RESNET50_2_TORCHVISION: StaticPretrainedWeightsDescriptor = torchvision_weights!(
    "wide_resnet50_2",
    "Wide ResNet-50-2 pretrained on ImageNet",
    "wide_resnet50_2-95faca4d.pth"
);

/// `Wide ResNet-101-2` pretrained on `ImageNet`.
pub static WIDE_RESNET101_2_TORCHVISION: StaticPretrainedWeightsDescriptor = torchvision_weights!(
    "wide_resnet101_2",
    "Wide ResNet-101-2 pretrained on ImageNet",
    "wide_resnet101_2-32ee1156.pth"
);

/// Static description of a well-known [`ResNetConfig`].
#[derive(Debug)]
pub struct StaticResNetPreFab {
    /// Name of the preset.
    pub name: &'static str,

    /// Description of the preset.
    pub description: &'static str,

    /// Builder function for the config.
    pub builder: fn() -> ResNetConfig,

    /// When set, the preset's ``groups`` wins over overrides.
    pub pins_groups: bool,

    /// When set, the preset's ``width_per_group`` wins over overrides.
    pub pins_width: bool,

    /// Published weights, if any.
    pub weights: Option<&'static StaticPretrainedWeightsDescriptor<'static>>,
}

/// Every registered preset.
pub static RESNET_PREFABS: [StaticResNetPreFab; 9] = [
    StaticResNetPreFab {
        name: "resnet18",
        description: "ResNet-18; Basic blocks [2, 2, 2, 2]",
        builder: ResNetConfig::resnet18,
        pins_groups: false,
        pins_width: false,
        weights: Some(&RESNET18_TORCHVISION),
    },
    StaticResNetPreFab {
        name: "resnet34",
        description: "ResNet-34; Basic blocks [3, 4, 6, 3]",
        builder: ResNetConfig::resnet34,
        pins_groups: false,
        pins_width: false,
        weights: Some(&RESNET34_TORCHVISION),
    },
    StaticResNetPreFab {
        name: "resnet50",
        description: "ResNet-50; Bottleneck blocks [3, 4, 6, 3]",
        builder: ResNetConfig::resnet50,
        pins_groups: false,
        pins_width: false,
        weights: Some(&RESNET50_TORCHVISION),
    },
    StaticResNetPreFab {
        name: "resnet101",
        description: "ResNet-101; Bottleneck blocks [3, 4, 23, 3]",
        builder: ResNetConfig::resnet101,
        pins_groups: false,
        pins_width: false,
        weights: Some(&RESNET101_TORCHVISION),
    },
    StaticResNetPreFab {
        name: "resnet152",
        description: "ResNet-152; Bottleneck blocks [3, 8, 36, 3]",
        builder: ResNetConfig::resnet152,
        pins_groups: false,
        pins_width: false,
        weights: Some(&RESNET152_TORCHVISION),
    },
    StaticResNetPreFab {
        name: "resnext50_32x4d",
        description: "ResNeXt-50; Bottleneck blocks [3, 4, 6, 3], 32 groups of width 4",
        builder: ResNetConfig::resnext50_32x4d,
        pins_groups: true,
        pins_width: true,
        weights: Some(&RESNEXT50_32X4D_TORCHVISION),
    },
    StaticResNetPreFab {
        name: "resnext101_32x8d",
        description: "ResNeXt-101; Bottleneck blocks [3, 4, 23, 3], 32 groups of width 8",
        builder: ResNetConfig::resnext101_32x8d,
        pins_groups: true,
        pins_width: true,
        weights: Some(&RESNEXT101_32X8D_TORCHVISION),
    },
    StaticResNetPreFab {
        name: "wide_resnet50_2",
        description: "Wide ResNet-50-2; Bottleneck blocks [3, 4, 6, 3], width 128",
        builder: ResNetConfig::wide_resnet50_2,
        pins_groups: false,
        pins_width: true,
        weights: Some(&WIDE_RESNET50_2_TORCHVISION),
    },
    StaticResNetPreFab {
        name: "wide_resnet101_2",
        description: "Wide ResNet-101-2; Bottleneck blocks [3, 4, 23, 3], width 128",
        builder: ResNetConfig::wide_resnet101_2,
        pins_groups: false,
        pins_width: true,
        weights: Some(&WIDE_RESNET101_2_TORCHVISION),
    },
];

/// Find a preset by name.
pub fn lookup_prefab(name: &str) -> ResNetResult<&'static StaticResNetPreFab> {
    RESNET_PREFABS
        .iter()
        .find(|prefab| prefab.name == name)
        .ok_or_else(|| ResNetError::UnknownPreset {
            name: name.to_string(),
        })
}

/// The names of every registered preset.
pub fn prefab_names() -> Vec<&'static str> {
    RESNET_PREFABS.iter().map(|prefab| prefab.name).collect()
}

/// Optional edits applied on top of a preset.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ResNetOverrides {
    /// Classifier outputs.
    pub num_classes: Option<usize>,

    /// Convolution groups.
    pub groups: Option<usize>,

    /// Width per group.
    pub base_width: Option<usize>,

    /// Per-stage (2, 3, 4) dilation policy; must have 3 elements.
    pub replace_stride_with_dilation: Option<Vec<bool>>,

    /// Zero the final norm scale of every block after init.
    pub zero_init_residual: Option<bool>,

    /// Normalization capability.
    pub normalization: Option<NormalizationConfig>,
}

impl ResNetOverrides {
    /// Apply the overrides.
    ///
    /// With `pins_groups` / `pins_width`, ``groups`` / ``base_width``
    /// are left as the config has them.
    pub fn apply(
        &self,
        mut config: ResNetConfig,
        pins_groups: bool,
        pins_width: bool,
    ) -> ResNetConfig {
        if let Some(num_classes) = self.num_classes {
            config.num_classes = num_classes;
        }
        if let Some(groups) = self.groups.filter(|_| !pins_groups) {
            config.groups = groups;
        }
        if let Some(base_width) = self.base_width.filter(|_| !pins_width) {
            config.width_per_group = base_width;
        }
        if let Some(policy) = &self.replace_stride_with_dilation {
            config.replace_stride_with_dilation = Some(policy.clone());
        }
        if let Some(zero_init_residual) = self.zero_init_residual {
            config.zero_init_residual = zero_init_residual;
        }
        if let Some(normalization) = &self.normalization {
            config.normalization = normalization.clone();
        }
        config
    }
}

impl StaticResNetPreFab {
    /// The preset config, with overrides applied.
    pub fn to_config(
        &self,
        overrides: &ResNetOverrides,
    ) -> ResNetConfig {
        overrides.apply((self.builder)(), self.pins_groups, self.pins_width)
    }

    /// The published weights descriptor.
    pub fn weights_descriptor(&self) -> ResNetResult<PretrainedWeightsDescriptor> {
        match self.weights {
            Some(weights) => Ok(weights.to_descriptor()),
            None => Err(ResNetError::NoPretrainedWeights {
                name: self.name.to_string(),
            }),
        }
    }

    /// Build and initialize the preset.
    pub fn build<B: Backend>(
        &self,
        overrides: &ResNetOverrides,
        device: &B::Device,
    ) -> ResNetResult<ResNet<B>> {
        let model: ResNet<B> = self.to_config(overrides).try_init(device)?;
        tracing::info!(
            preset = self.name,
            num_params = model.num_params(),
            num_classes = model.num_classes(),
            "built preset"
        );
        Ok(model)
    }

    /// Build the preset, and apply its published weights.
    ///
    /// The weights are applied all-or-nothing.
    pub fn build_pretrained<B: Backend>(
        &self,
        overrides: &ResNetOverrides,
        fetcher: &dyn WeightFetcher,
        device: &B::Device,
    ) -> ResNetResult<ResNet<B>> {
        let descriptor = self.weights_descriptor()?;
        let model = self.build::<B>(overrides, device)?;

        let weights = fetcher
            .fetch(&descriptor)
            .map_err(ResNetError::WeightFetch)?;
        let model = model.load_weight_map(&weights)?;

        tracing::info!(
            preset = self.name,
            weights = %descriptor.name,
            num_tensors = weights.len(),
            "applied pretrained weights"
        );
        Ok(model)
    }
}

/// Build a named preset.
///
/// # Returns
///
/// The initialized model; or [`ResNetError::UnknownPreset`], or a configuration error.
pub fn build_resnet<B: Backend>(
    name: &str,
    overrides: &ResNetOverrides,
    device: &B::Device,
) -> ResNetResult<ResNet<B>> {
    lookup_prefab(name)?.build(overrides, device)
}

/// Build a named preset, hydrated with its published weights.
pub fn build_pretrained<B: Backend>(
    name: &str,
    overrides: &ResNetOverrides,
    fetcher: &dyn WeightFetcher,
    device: &B::Device,
) -> ResNetResult<ResNet<B>> {
    lookup_prefab(name)?.build_pretrained(overrides, fetcher, device)
}

/// Build a named preset; with `fetcher`, hydrated with its published weights.
pub fn build<B: Backend>(
    name: &str,
    fetcher: Option<&dyn WeightFetcher>,
    overrides: &ResNetOverrides,
    device: &B::Device,
) -> ResNetResult<ResNet<B>> {
    match fetcher {
        Some(fetcher) => build_pretrained(name, overrides, fetcher, device),
        None => build_resnet(name, overrides, device),
    }
}
