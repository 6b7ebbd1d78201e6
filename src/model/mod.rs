pub mod attention;
pub mod transformer;

use burn::prelude::*;

use crate::data_helpers::TranslationBatch;

pub use attention::{AttentionConfig, AttentionSeq2Seq};
pub use transformer::{Transformer, TransformerConfig};

/// A sequence-to-sequence model trainable with teacher forcing.
pub trait TranslationModel<B: Backend> {
    /// Padding-masked cross entropy of predicting `batch.target` after its
    /// start marker, with the true previous token as decoder input.
    fn forward_loss(&self, batch: TranslationBatch<B>) -> Tensor<B, 1>;
}

/// Architecture and hyperparameters of a saved model, stored next to its
/// checkpoints so inference can rebuild it.
#[derive(Config, Debug)]
pub enum ModelConfig {
    Attention(AttentionConfig),
    Transformer(TransformerConfig),
}

impl ModelConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ModelConfig::Attention(_) => "attention",
            ModelConfig::Transformer(_) => "transformer",
        }
    }

    pub fn vocab_sizes(&self) -> (usize, usize) {
        match self {
            ModelConfig::Attention(c) => (c.input_vocab_size, c.target_vocab_size),
            ModelConfig::Transformer(c) => (c.input_vocab_size, c.target_vocab_size),
        }
    }
}
