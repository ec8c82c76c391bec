//! Train an offer ranking model on a CSV interaction table.
//!
//! ```text
//! RUST_LOG=info train --data offers.csv --model fm --iterations 100000 --output history.json
//! ```
#[macro_use]
extern crate log;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;

use offer_rank::config::{ExperimentConfig, ModelKind};
use offer_rank::data::{Partition, Split};
use offer_rank::datasets;
use offer_rank::models::factorization::FactorizationModel;
use offer_rank::models::fm::FactorizationMachine;
use offer_rank::models::TrainingHistory;

#[derive(Parser, Debug)]
#[command(name = "train")]
#[command(about = "Train a BPR offer ranking model")]
struct Args {
    /// Interaction table (CSV).
    #[arg(short, long)]
    data: PathBuf,

    /// Experiment configuration (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model to train, overriding the configuration: `mf` or `fm`.
    #[arg(short, long)]
    model: Option<ModelKind>,

    /// Number of SGD steps, overriding the configuration.
    #[arg(short, long)]
    iterations: Option<usize>,

    /// Where to write the training history (JSON).
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn describe(partition: &Partition) {
    info!(
        "{} requests: {} train, {} test.",
        partition.requests().len(),
        partition.reduced_train().len(),
        partition.reduced_test().len()
    );
}

fn summarize(history: &TrainingHistory) {
    let last = match history.last() {
        Some(last) => last,
        None => {
            warn!("No snapshots were recorded.");
            return;
        }
    };

    for &split in &[Split::Train, Split::Test] {
        let metrics = last.metrics(split);
        let recall = metrics
            .ranking
            .recall
            .keys()
            .map(|&k| format!("R@{} {:?}", k, metrics.ranking.mean_recall(k)))
            .collect::<Vec<_>>()
            .join(", ");

        info!(
            "{:?}: accuracy {:?}, {}, MAP {:?}, position bias {:?}",
            split,
            metrics.accuracy,
            recall,
            metrics.ranking.mean_map(),
            metrics.ranking.mean_position_bias()
        );
    }

    if history.skipped() > 0 {
        warn!("{} iterations were skipped.", history.skipped());
    }
}

fn main() -> Result<(), failure::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => ExperimentConfig::from_path(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(iterations) = args.iterations {
        config.fit = config.fit.num_iterations(iterations);
    }

    let data = datasets::load_csv(&args.data)?;

    info!(
        "Training {} for {} iterations.",
        config.model,
        config.fit.get_num_iterations()
    );

    let history = match config.model {
        ModelKind::Factorization => {
            let mut model = FactorizationModel::new(&data, config.hyperparameters.clone())?;
            describe(model.partition());
            model.fit(&config.fit)?.clone()
        }
        ModelKind::FactorizationMachine => {
            let mut model = FactorizationMachine::new(&data, config.hyperparameters.clone())?;
            describe(model.partition());
            model.fit(&config.fit)?.clone()
        }
    };

    summarize(&history);

    if let Some(ref path) = args.output {
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &history)?;
        info!("History written to {}.", path.display());
    }

    Ok(())
}
