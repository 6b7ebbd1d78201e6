use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, Result, anyhow, bail};
use burn::{
    data::{
        dataloader::{DataLoader, MultiThreadDataLoader},
        dataset::transform::ShuffledDataset,
    },
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use clap::ValueEnum;
use log::{debug, info};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::CheckpointManager,
    corpus::read_pairs,
    data_helpers::{
        DropRemainderBatchStrategy, TranslationBatch, TranslationCorpus, TranslationPair, encode_pairs,
        loader_workers, steps_per_epoch,
    },
    early_stopping::EarlyStopping,
    model::{AttentionConfig, ModelConfig, TransformerConfig, TranslationModel},
    vocab::SubwordVocab,
};

pub const INPUT_VOCAB_FILE: &str = "tok_lang1.json";
pub const TARGET_VOCAB_FILE: &str = "tok_lang2.json";
pub const CHECKPOINT_DIR: &str = "checkpoints/train";
pub const MODEL_CONFIG_FILE: &str = "model.json";
pub const TRAINING_CONFIG_FILE: &str = "config.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// GRU encoder-decoder with Bahdanau attention
    Attention,
    /// Encoder-decoder Transformer
    Transformer,
}

#[derive(Config)]
pub struct TrainingConfig {
    pub optimizer: AdamConfig,
    #[config(default = "Architecture::Attention")]
    pub architecture: Architecture,
    #[config(default = 40_000)]
    pub num_examples: usize,
    #[config(default = true)]
    pub lowercase: bool,
    /// Longest kept sequence, start and end markers included.
    #[config(default = 40)]
    pub max_length: usize,
    #[config(default = 8192)]
    pub target_vocab_size: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 100)]
    pub num_epochs: usize,
    #[config(default = 5)]
    pub patience: usize,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    /// Save every this many epochs, `0` to only save at the end.
    #[config(default = 10)]
    pub checkpoint_every: usize,
    #[config(default = 5)]
    pub max_to_keep: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 0xdeadbeef)]
    pub seed: u64,
    #[config(default = 256)]
    pub embedding_dim: usize,
    #[config(default = 1024)]
    pub units: usize,
    #[config(default = true)]
    pub batch_norm: bool,
    #[config(default = 6)]
    pub num_layers: usize,
    #[config(default = 512)]
    pub d_model: usize,
    #[config(default = 8)]
    pub num_heads: usize,
    #[config(default = 2048)]
    pub dff: usize,
    #[config(default = 0.1)]
    pub dropout: f64,
}

impl TrainingConfig {
    pub fn model_config(&self, input_vocab_size: usize, target_vocab_size: usize) -> ModelConfig {
        match self.architecture {
            Architecture::Attention => ModelConfig::Attention(
                AttentionConfig::new(input_vocab_size, target_vocab_size)
                    .with_embedding_dim(self.embedding_dim)
                    .with_units(self.units)
                    .with_batch_norm(self.batch_norm),
            ),
            Architecture::Transformer => ModelConfig::Transformer(
                TransformerConfig::new(input_vocab_size, target_vocab_size)
                    .with_num_layers(self.num_layers)
                    .with_d_model(self.d_model)
                    .with_num_heads(self.num_heads)
                    .with_dff(self.dff)
                    .with_dropout(self.dropout),
            ),
        }
    }
}

/// What a finished run did.
#[derive(Clone, Debug)]
pub struct TrainingReport {
    pub epoch_losses: Vec<f64>,
    pub stopped_early: bool,
    pub last_checkpoint: PathBuf,
}

/// Trains a translation model on the sentence pairs in `corpus_path` and
/// writes vocabularies, configs and checkpoints under `artifact_dir`.
pub fn train<B: AutodiffBackend>(
    corpus_path: &Path,
    artifact_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<TrainingReport> {
    let checkpoint_dir = artifact_dir.join(CHECKPOINT_DIR);
    create_dir_all(&checkpoint_dir)
        .with_context(|| format!("Could not create {}", checkpoint_dir.display()))?;

    config
        .save(checkpoint_dir.join(TRAINING_CONFIG_FILE))
        .context("Could not save training config")?;

    B::seed(config.seed);

    let pairs = read_pairs(corpus_path, config.num_examples, config.lowercase)?;
    let (source_lines, target_lines): (Vec<_>, Vec<_>) = pairs
        .iter()
        .map(|pair| (pair.source.as_str(), pair.target.as_str()))
        .unzip();

    let input_vocab = SubwordVocab::build_from_corpus(&source_lines, config.target_vocab_size)?;
    let target_vocab = SubwordVocab::build_from_corpus(&target_lines, config.target_vocab_size)?;
    input_vocab.save(artifact_dir.join(INPUT_VOCAB_FILE))?;
    target_vocab.save(artifact_dir.join(TARGET_VOCAB_FILE))?;

    let corpus = encode_pairs(&pairs, &input_vocab, &target_vocab, config.max_length)?;

    let model_config = config.model_config(input_vocab.model_vocab_size(), target_vocab.model_vocab_size());
    model_config
        .save(checkpoint_dir.join(MODEL_CONFIG_FILE))
        .context("Could not save model config")?;

    let checkpoints = CheckpointManager::new(checkpoint_dir, config.max_to_keep)?;

    info!(
        "Training {} model (vocabularies {} / {})",
        model_config.name(),
        input_vocab.model_vocab_size(),
        target_vocab.model_vocab_size()
    );

    match model_config {
        ModelConfig::Attention(c) => fit::<B, _>(c.init::<B>(&device), &config, &corpus, checkpoints, device),
        ModelConfig::Transformer(c) => fit::<B, _>(c.init_transformer::<B>(&device), &config, &corpus, checkpoints, device),
    }
}

/// The epoch loop: teacher-forced updates, periodic checkpoints and early
/// stopping on the mean epoch loss.
pub fn fit<B, M>(
    mut model: M,
    config: &TrainingConfig,
    corpus: &TranslationCorpus,
    mut checkpoints: CheckpointManager,
    device: B::Device,
) -> Result<TrainingReport>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + TranslationModel<B>,
{
    // Worker shares are contiguous, so mix the corpus before it is split.
    let dataset = ShuffledDataset::with_seed(corpus.dataset(), config.seed);
    let steps = steps_per_epoch(&dataset, config.batch_size);
    if steps == 0 {
        bail!(
            "{} sentence pairs do not fill a single batch of {}",
            corpus.pairs.len(),
            config.batch_size
        );
    }

    let workers = loader_workers(steps, config.num_workers);
    if workers != config.num_workers.max(1) {
        info!("Using {workers} loader workers so that each gets whole batches");
    }

    let dataloader: MultiThreadDataLoader<B, TranslationPair, TranslationBatch<B>> = MultiThreadDataLoader::new(
        Box::new(DropRemainderBatchStrategy::new(
            config
                .batch_size
                .try_into()
                .map_err(|_| anyhow!("Batch size must be positive"))?,
        )),
        Arc::new(dataset),
        Arc::new(corpus.batcher()),
        workers,
        device.clone(),
        Some(StdRng::seed_from_u64(config.seed)),
    );

    let mut optim = config.optimizer.init::<B, M>();
    let mut stopper = EarlyStopping::new(config.patience);
    let mut stopped_early = false;

    info!("Training start: {} epochs of {steps} steps", config.num_epochs);

    for epoch in 1..=config.num_epochs {
        let start = Instant::now();
        info!("Epoch {epoch} started");

        let mut loss_sum = 0.0;
        let mut batches = 0usize;

        for batch in dataloader.iter() {
            let loss = model.forward_loss(batch);
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(config.learning_rate, model, grads);

            loss_sum += loss_value;
            batches += 1;
            debug!("Batch {batches}/{steps}: loss {loss_value:.4}");
        }

        if batches == 0 {
            bail!("Epoch {epoch} produced no batches");
        }

        let epoch_loss = loss_sum / batches as f64;
        info!(
            "Epoch {epoch} done. Time: {:.2}s Loss: {epoch_loss:.4}",
            start.elapsed().as_secs_f64()
        );

        if config.checkpoint_every > 0 && epoch % config.checkpoint_every == 0 {
            checkpoints.save(&model, &optim)?;
        }

        if stopper.record(epoch_loss) {
            info!("Early stopping after epoch {epoch}");
            stopped_early = true;
            break;
        }
    }

    let last_checkpoint = checkpoints.save(&model, &optim)?;
    info!("Training end");

    Ok(TrainingReport {
        epoch_losses: stopper.history().to_vec(),
        stopped_early,
        last_checkpoint,
    })
}
