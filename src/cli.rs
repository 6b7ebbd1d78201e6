use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};

use anyhow::{Context, Result, anyhow, bail};
use burn::{optim::AdamConfig, prelude::Config};
use clap::{Args, Parser, Subcommand};
use log::info;

use nmt::{
    backend::{MyAutodiffBackend, MyBackend, device},
    train::{Architecture, TrainingConfig, train},
    translate::{MAX_LENGTH, TranslateOptions, translate},
};

#[derive(Parser, Debug)]
#[command(version, about = "Train a neural translation model and translate with it")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a model on a tab-separated sentence-pair corpus
    Train(TrainArgs),
    /// Translate one sentence with the latest checkpoint
    Translate(TranslateArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Sentence pairs, `source<TAB>target[<TAB>...]` per line, or parquet
    #[arg(long, default_value = "./fra.txt")]
    pub corpus: PathBuf,

    /// Where vocabularies and checkpoints/train/ are written
    #[arg(long, default_value = ".")]
    pub artifact_dir: PathBuf,

    /// Training config JSON; replaces every hyperparameter flag below
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Architecture::Attention)]
    pub architecture: Architecture,

    #[arg(long, default_value_t = 40_000)]
    pub examples: usize,

    #[arg(long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Stop once this many earlier epochs had a lower loss
    #[arg(long, default_value_t = 5)]
    pub patience: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub learning_rate: f64,

    /// Longest sequence kept, start and end markers included
    #[arg(long, default_value_t = 40)]
    pub max_length: usize,

    #[arg(long, default_value_t = 8192)]
    pub target_vocab_size: usize,

    #[arg(long, default_value_t = 10)]
    pub checkpoint_every: usize,

    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    #[arg(long, default_value_t = 0xdeadbeef)]
    pub seed: u64,

    /// Keep the original casing of the corpus
    #[arg(long)]
    pub keep_case: bool,
}

impl TrainArgs {
    fn training_config(&self) -> Result<TrainingConfig> {
        if let Some(path) = &self.config {
            return TrainingConfig::load(path).map_err(|e| anyhow!("Could not load {}: {e}", path.display()));
        }

        Ok(TrainingConfig::new(AdamConfig::new())
            .with_architecture(self.architecture)
            .with_num_examples(self.examples)
            .with_num_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_patience(self.patience)
            .with_learning_rate(self.learning_rate)
            .with_max_length(self.max_length)
            .with_target_vocab_size(self.target_vocab_size)
            .with_checkpoint_every(self.checkpoint_every)
            .with_num_workers(self.num_workers)
            .with_seed(self.seed)
            .with_lowercase(!self.keep_case))
    }
}

#[derive(Args, Debug)]
pub struct TranslateArgs {
    /// Path to the input vocabulary
    #[arg(long, default_value = "tok_lang1.json")]
    pub input_vocab: PathBuf,

    /// Path to the target vocabulary
    #[arg(long, default_value = "tok_lang2.json")]
    pub target_vocab: PathBuf,

    /// Path to the checkpoint directory
    #[arg(long, default_value = "./checkpoints/train")]
    pub checkpoint: PathBuf,

    /// Sentence to translate; read from stdin when absent
    #[arg(long)]
    pub sentence: Option<String>,

    #[arg(long, default_value_t = MAX_LENGTH)]
    pub max_length: usize,
}

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Could not read from stdin")?;

    let line = line.trim().to_string();
    if line.is_empty() {
        bail!("Nothing to translate");
    }

    Ok(line)
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_train(args),
            Commands::Translate(args) => run_translate(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let config = args.training_config()?;
    info!("Training on {}", args.corpus.display());

    let report = train::<MyAutodiffBackend>(&args.corpus, &args.artifact_dir, config, device())?;

    if report.stopped_early {
        println!("Early stopping...");
    }
    println!(
        "Trained {} epochs, final checkpoint {}",
        report.epoch_losses.len(),
        report.last_checkpoint.display()
    );

    Ok(())
}

fn run_translate(args: TranslateArgs) -> Result<()> {
    let options = TranslateOptions {
        input_vocab: args.input_vocab,
        target_vocab: args.target_vocab,
        checkpoint_dir: args.checkpoint,
        max_length: args.max_length,
    };

    let sentence = match args.sentence {
        Some(sentence) => sentence,
        None => prompt("Input:: ")?,
    };

    let translation = translate::<MyBackend>(&options, &sentence, device())?;

    println!("Input: {}", translation.input);
    println!("Predicted: {}", translation.predicted);

    Ok(())
}
