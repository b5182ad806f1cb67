pub mod error;
pub mod export;
pub mod metrics;
pub mod model;
pub mod parsing;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use export::Precision;
use metrics::{CsvSink, MultiSink, TracingSink};
use model::conv_net::{Architecture, ConvNet, TrainingConfig};
use model::neural_net::{self, ActivationFunction, InitMethod};
use model::optim::OptimizerKind;
use model::Model;
use ndarray::Array4;
use parsing::split::{self, SplitRatios};
use parsing::Dataset;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const NUM_CLASSES: usize = 26;
const GREYSCALE_SIZE: f64 = 255f64;

#[derive(Parser, Debug)]
#[command(version, about = "Train and run a handwritten letter classifier on EMNIST letters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode, split, train, evaluate and export
    Train(TrainArgs),
    /// Classify a raw greyscale glyph with an exported model
    Classify {
        /// The exported model
        #[arg(short, long)]
        model: PathBuf,

        /// rows * cols unsigned bytes, in the orientation of the training images
        #[arg(short, long)]
        image: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// The path of the images container, e.g. emnist-letters-train-images-idx3-ubyte
    #[arg(long)]
    images: PathBuf,

    /// The path of the labels container, e.g. emnist-letters-train-labels-idx1-ubyte
    #[arg(long)]
    labels: PathBuf,

    /// Subtracted from every raw label (EMNIST letters are 1-based)
    #[arg(long, default_value_t = 1)]
    label_offset: u8,

    /// Number of epochs to train the network for
    #[arg(short = 'n', long, default_value_t = 20)]
    num_epochs: usize,

    /// Batch size of the network
    #[arg(short, long, default_value_t = 32)]
    batch_size: usize,

    /// Learning rate of the network
    #[arg(short, long, default_value_t = 0.001)]
    learning_rate: f64,

    #[arg(long, value_enum, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,

    /// Activation function used by the network
    #[arg(short, long, value_enum, default_value_t = ActivationFunction::ReLU)]
    activation_function: ActivationFunction,

    /// Weight initialization method of the dense head
    #[arg(short, long, value_enum, default_value_t = InitMethod::Xavier)]
    initialization: InitMethod,

    /// Feature maps produced by the convolution
    #[arg(long, default_value_t = 8)]
    conv_channels: usize,

    #[arg(long, default_value_t = 5)]
    kernel_size: usize,

    #[arg(long, default_value_t = 2)]
    pool_size: usize,

    /// Hidden layer sizes of the dense head, e.g. "128 64"
    #[arg(long, num_args = 0.., value_delimiter = ' ', default_value = "128")]
    hidden: Vec<usize>,

    /// Seed for the split, the initial weights and the shuffling
    #[arg(short, long)]
    seed: Option<u64>,

    /// Save the per-epoch metrics as CSV
    #[arg(long)]
    metrics_csv: Option<PathBuf>,

    /// Where the exported model goes
    #[arg(short, long, default_value = "letter_classification_model.json")]
    output: PathBuf,

    /// Store the weights as int8 with a per-tensor scale
    #[arg(short, long)]
    quantize: bool,
}

fn train(args: TrainArgs) -> anyhow::Result<()> {
    let dataset = Dataset::load(&args.images, &args.labels, args.label_offset, NUM_CLASSES)
        .context("failed to load the dataset")?;
    tracing::debug!(counts = ?dataset.class_counts(NUM_CLASSES), "class distribution");

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let split = split::train_val_test_split(&dataset, SplitRatios::default(), &mut rng)
        .context("failed to split the dataset")?;

    let architecture = Architecture {
        input_shape: dataset.image_shape(),
        conv_channels: args.conv_channels,
        kernel_size: args.kernel_size,
        pool_size: args.pool_size,
        hidden: args.hidden,
        num_classes: NUM_CLASSES,
        activation_function: args.activation_function,
        init_method: args.initialization,
    };
    let training = TrainingConfig {
        num_epochs: args.num_epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        optimizer: args.optimizer,
        seed: args.seed,
    };
    let mut net = ConvNet::new(&architecture, training, &mut rng)?;

    let mut sink = MultiSink::default();
    sink.push(Box::new(TracingSink));
    if let Some(path) = &args.metrics_csv {
        let csv = CsvSink::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        sink.push(Box::new(csv));
    }

    net.fit(&split.train, Some(&split.validation), &mut sink)
        .context("training failed")?;

    let evaluation = model::evaluate(&net, &split.test, args.batch_size);
    tracing::info!(
        accuracy = evaluation.accuracy(),
        examples = split.test.len(),
        "tested accuracy"
    );
    for (class, accuracy) in evaluation
        .per_class_accuracy(NUM_CLASSES)
        .into_iter()
        .enumerate()
    {
        if let Some(accuracy) = accuracy {
            tracing::debug!(letter = %letter(class), accuracy, "per-class accuracy");
        }
    }

    let precision = if args.quantize {
        Precision::Int8
    } else {
        Precision::F64
    };
    let size = export::save(&args.output, &net, precision)
        .with_context(|| format!("failed to export {}", args.output.display()))?;

    println!("Tested accuracy: {:.4}", evaluation.accuracy());
    println!("Model written to {} ({} bytes)", args.output.display(), size);

    Ok(())
}

fn classify(model_path: &Path, image_path: &Path) -> anyhow::Result<()> {
    let net = export::load(model_path)
        .with_context(|| format!("failed to load {}", model_path.display()))?;
    let (rows, cols) = net.input_shape;

    let image_bytes =
        fs::read(image_path).with_context(|| format!("failed to read {}", image_path.display()))?;
    if image_bytes.len() != rows * cols {
        bail!(
            "expected {} bytes ({}x{} image), got {} bytes",
            rows * cols,
            rows,
            cols,
            image_bytes.len()
        );
    }

    let pixels: Vec<f64> = image_bytes
        .iter()
        .map(|&x| x as f64 / GREYSCALE_SIZE)
        .collect();
    let input = Array4::from_shape_vec((1, 1, rows, cols), pixels)?;

    let probabilities = net.predict(&input.view());
    let class = neural_net::argmax(probabilities.row(0));

    println!(
        "Prediction: {} (class {}, p = {:.4})",
        letter(class),
        class,
        probabilities[[0, class]]
    );

    Ok(())
}

/// The letter of a 0-based class id
fn letter(class: usize) -> char {
    char::from(b'A' + (class % NUM_CLASSES) as u8)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Classify { model, image } => classify(&model, &image),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn train_defaults_follow_the_pipeline() {
        let cli = Cli::parse_from(["emnist-letters", "train", "--images", "i", "--labels", "l"]);

        let Commands::Train(args) = cli.command else {
            panic!("expected the train command");
        };
        assert_eq!(args.label_offset, 1);
        assert_eq!(args.num_epochs, 20);
        assert_eq!(args.hidden, vec![128]);
        assert_eq!(args.optimizer, OptimizerKind::Adam);
        assert!(!args.quantize);
    }

    #[test]
    fn enum_flags_use_short_names() {
        let cli = Cli::parse_from([
            "emnist-letters",
            "train",
            "--images",
            "i",
            "--labels",
            "l",
            "--activation-function",
            "leaky-relu",
            "--optimizer",
            "sgd",
            "--hidden",
            "64 32",
        ]);

        let Commands::Train(args) = cli.command else {
            panic!("expected the train command");
        };
        assert_eq!(args.activation_function, ActivationFunction::LeakyReLU);
        assert_eq!(args.optimizer, OptimizerKind::Sgd);
        assert_eq!(args.hidden, vec![64, 32]);
    }

    #[test]
    fn letters_start_at_a() {
        assert_eq!(letter(0), 'A');
        assert_eq!(letter(25), 'Z');
    }
}
