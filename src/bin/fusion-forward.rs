//! Fusion network smoke CLI.
//!
//! Builds the network on a chosen device and runs one forward pass on random
//! inputs, printing the logits shape and a per-class score for the first
//! sample. Useful as an end-to-end wiring check without a data pipeline.
//!
//! Usage:
//!   fusion-forward [OPTIONS]
//!
//! Options:
//!   --config <PATH>      JSON configuration file (default: built-in defaults)
//!   --device <DEVICE>    Device for the forward pass (cpu|cuda:N) [default: cpu]
//!   --bands <N>          Override the spectral band count
//!   --classes <N>        Override the class count
//!   --image-size <N>     Override the patch spatial size
//!   --batch <N>          Batch size for the random input [default: 2]
//!   --help               Show this help message

use hsi_fusion_ml::{FusionConfig, FusionError, FusionNetwork, Result};
use tch::{nn, Device, Tensor};

struct Args {
    config_path: Option<String>,
    device: Device,
    bands: Option<i64>,
    classes: Option<i64>,
    image_size: Option<i64>,
    batch: i64,
}

fn parse_device(s: &str) -> Result<Device> {
    if s == "cpu" {
        return Ok(Device::Cpu);
    }
    if let Some(index) = s.strip_prefix("cuda:") {
        let index: usize = index
            .parse()
            .map_err(|_| FusionError::config(format!("invalid CUDA device index: '{index}'")))?;
        return Ok(Device::Cuda(index));
    }
    Err(FusionError::config(format!(
        "unknown device '{s}' (expected cpu or cuda:N)"
    )))
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args {
        config_path: None,
        device: Device::Cpu,
        bands: None,
        classes: None,
        image_size: None,
        batch: 2,
    };

    let raw: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < raw.len() {
        let take_value = |i: usize| -> Result<&str> {
            raw.get(i + 1)
                .map(String::as_str)
                .ok_or_else(|| FusionError::config(format!("{} requires a value", raw[i])))
        };
        match raw[i].as_str() {
            "--help" => return Ok(None),
            "--config" => {
                args.config_path = Some(take_value(i)?.to_string());
                i += 2;
            }
            "--device" => {
                args.device = parse_device(take_value(i)?)?;
                i += 2;
            }
            "--bands" => {
                args.bands = Some(parse_int(take_value(i)?, "--bands")?);
                i += 2;
            }
            "--classes" => {
                args.classes = Some(parse_int(take_value(i)?, "--classes")?);
                i += 2;
            }
            "--image-size" => {
                args.image_size = Some(parse_int(take_value(i)?, "--image-size")?);
                i += 2;
            }
            "--batch" => {
                args.batch = parse_int(take_value(i)?, "--batch")?;
                i += 2;
            }
            other => {
                return Err(FusionError::config(format!("unknown option '{other}'")));
            }
        }
    }
    Ok(Some(args))
}

fn parse_int(value: &str, flag: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|_| FusionError::config(format!("{flag} expects an integer, got '{value}'")))
}

fn print_help() {
    println!("fusion-forward - run one random forward pass through the fusion network");
    println!();
    println!("Usage: fusion-forward [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <PATH>     JSON configuration file");
    println!("  --device <DEVICE>   cpu or cuda:N [default: cpu]");
    println!("  --bands <N>         override the spectral band count");
    println!("  --classes <N>       override the class count");
    println!("  --image-size <N>    override the patch spatial size");
    println!("  --batch <N>         batch size for the random input [default: 2]");
    println!("  --help              show this help message");
}

fn main() -> Result<()> {
    // Respects the RUST_LOG environment variable.
    env_logger::init();

    let Some(args) = parse_args()? else {
        print_help();
        return Ok(());
    };

    let mut config = match &args.config_path {
        Some(path) => FusionConfig::from_json_file(path)?,
        None => FusionConfig::default(),
    };
    if let Some(bands) = args.bands {
        config.num_bands = bands;
    }
    if let Some(classes) = args.classes {
        config.num_classes = classes;
    }
    if let Some(size) = args.image_size {
        config.image_size = size;
    }
    config.validate()?;

    log::info!(
        "building network: {} bands, {}x{} patch, {} classes, device {:?}",
        config.num_bands,
        config.image_size,
        config.image_size,
        config.num_classes,
        args.device
    );

    let vs = nn::VarStore::new(args.device);
    let network = FusionNetwork::new(&vs.root(), &config)?;

    let kind = (tch::Kind::Float, args.device);
    let spectral = Tensor::randn(
        [args.batch, 1, config.num_bands, config.image_size, config.image_size],
        kind,
    );
    let auxiliary = Tensor::randn([args.batch, 1, config.image_size, config.image_size], kind);

    let logits = network.forward(&spectral, &auxiliary, false);
    println!("logits shape: {:?}", logits.size());

    let first = Vec::<f64>::try_from(logits.get(0).to_kind(tch::Kind::Double))
        .map_err(|e| FusionError::config(format!("failed to read logits: {e}")))?;
    for (class, score) in first.iter().enumerate() {
        println!("class {class:2}: {score:9.4}");
    }

    Ok(())
}
