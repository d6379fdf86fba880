use anyhow::Context;
use bimm_resnet::compat::named_tensors::NamedTensors;
use bimm_resnet::models::resnet::layer_block::LayerBlockMeta;
use bimm_resnet::models::resnet::prefabs::{RESNET_PREFABS, ResNetOverrides, lookup_prefab};
use bimm_resnet::models::resnet::resnet_model::{ResNet, ResNetConfig};
use burn::backend::NdArray;
use burn::config::Config;
use burn::module::Module;
use burn::tensor::{Distribution, Tensor};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Preset name.
    #[arg(long, default_value = "resnet18")]
    preset: String,

    /// Load the config from a JSON file, instead of a preset.
    #[arg(long)]
    config: Option<PathBuf>,

    /// List the presets and exit.
    #[arg(long, default_value = "false")]
    list: bool,

    /// Override the number of classes.
    #[arg(long)]
    num_classes: Option<usize>,

    /// Override the stride-to-dilation policy; e.g. ``false,true,true``.
    #[arg(long, value_delimiter = ',')]
    dilation: Option<Vec<bool>>,

    /// Zero-init the final norm of every residual block.
    #[arg(long, default_value = "false")]
    zero_init_residual: bool,

    /// Input resolution.
    #[arg(long, default_value = "224")]
    resolution: usize,

    /// Batch size of the forward pass.
    #[arg(long, default_value = "1")]
    batch: usize,

    /// Run a forward pass on random input.
    #[arg(long, default_value = "false")]
    forward: bool,

    /// Print every named tensor shape.
    #[arg(long, default_value = "false")]
    tensors: bool,

    /// Save the resolved config as JSON.
    #[arg(long)]
    save_config: Option<PathBuf>,
}

fn resolve_config(args: &Args) -> anyhow::Result<ResNetConfig> {
    if let Some(path) = &args.config {
        return ResNetConfig::load(path)
            .map_err(|err| anyhow::anyhow!("loading config {}: {err}", path.display()));
    }

    let overrides = ResNetOverrides {
        num_classes: args.num_classes,
        replace_stride_with_dilation: args.dilation.clone(),
        zero_init_residual: args.zero_init_residual.then_some(true),
        ..Default::default()
    };
    Ok(lookup_prefab(&args.preset)?.to_config(&overrides))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.list {
        for prefab in RESNET_PREFABS.iter() {
            println!("{:<20} {}", prefab.name, prefab.description);
        }
        return Ok(());
    }

    type B = NdArray<f32>;
    let device = Default::default();

    let config = resolve_config(&args)?;
    if let Some(path) = &args.save_config {
        config
            .save(path)
            .with_context(|| format!("saving config: {}", path.display()))?;
        tracing::info!(path = %path.display(), "saved config");
    }
    println!("{}", serde_json::to_string_pretty(&config)?);

    let structure = config.to_structure()?;
    let resolution = [args.resolution, args.resolution];
    println!("stage     blocks  in      out     stride  dilation  output");
    for (idx, (layer, shape)) in structure
        .layers
        .iter()
        .zip(structure.stage_output_shapes(args.batch, resolution))
        .enumerate()
    {
        println!(
            "layer{:<4} {:<7} {:<7} {:<7} {:<7} {:<9} {:?}",
            idx + 1,
            layer.len(),
            layer.in_planes(),
            layer.out_planes(),
            layer.stride(),
            layer.dilation(),
            shape,
        );
    }

    let model: ResNet<B> = structure.try_init(&device)?;
    println!("parameters: {}", model.num_params());

    if args.tensors {
        for (path, shape) in model.named_shapes() {
            println!("{path}: {shape:?}");
        }
    }

    if args.forward {
        let input = Tensor::<B, 4>::random(
            [args.batch, config.in_channels, args.resolution, args.resolution],
            Distribution::Default,
            &device,
        );
        for (idx, feature) in model.forward_features(input.clone()).iter().enumerate() {
            println!("layer{} features: {:?}", idx + 1, feature.dims());
        }
        let logits = model.forward(input);
        println!("logits: {:?}", logits.dims());
    }

    Ok(())
}
