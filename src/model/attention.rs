use anyhow::Result;
use burn::{
    nn::{
        BatchNorm, BatchNormConfig, Embedding, EmbeddingConfig, Linear, LinearConfig,
        gru::{Gru, GruConfig},
        loss::CrossEntropyLossConfig,
    },
    prelude::*,
    tensor::activation::{softmax, tanh},
};

use crate::{
    data_helpers::TranslationBatch,
    decode::{GreedyDecoder, argmax_last},
    model::TranslationModel,
    vocab::PAD_ID,
};

/// Embeds a token batch and, if present, normalizes over the embedding
/// channels. `[batch, len] -> [batch, len, embedding_dim]`
fn embed<B: Backend>(embedding: &Embedding<B>, norm: &Option<BatchNorm<B, 1>>, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
    let x = embedding.forward(tokens);

    match norm {
        Some(norm) => norm.forward(x.swap_dims(1, 2)).swap_dims(1, 2),
        None => x,
    }
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    embedding: Embedding<B>,
    norm: Option<BatchNorm<B, 1>>,
    gru: Gru<B>,
}

impl<B: Backend> Encoder<B> {
    /// Returns every GRU output `[batch, len, units]` and the final hidden
    /// state `[batch, units]`.
    pub fn forward(&self, source: Tensor<B, 2, Int>) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let x = embed(&self.embedding, &self.norm, source);
        let output = self.gru.forward(x, None);

        let [batch_size, len, units] = output.dims();
        let hidden = output
            .clone()
            .slice([0..batch_size, len - 1..len, 0..units])
            .reshape([batch_size, units]);

        (output, hidden)
    }
}

/// Additive attention: `score = v · tanh(W1 · values + W2 · query)`.
#[derive(Module, Debug)]
pub struct BahdanauAttention<B: Backend> {
    w1: Linear<B>,
    w2: Linear<B>,
    v: Linear<B>,
}

impl<B: Backend> BahdanauAttention<B> {
    /// `query: [batch, units]`, `values: [batch, len, units]`.
    /// Returns the context vector `[batch, units]` and the attention weights
    /// `[batch, len]`.
    pub fn forward(&self, query: Tensor<B, 2>, values: Tensor<B, 3>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let query = query.unsqueeze_dim::<3>(1);

        let score = self
            .v
            .forward(tanh(self.w1.forward(values.clone()) + self.w2.forward(query)));
        let weights = softmax(score, 1);

        let context = (weights.clone() * values).sum_dim(1).squeeze::<2>(1);

        (context, weights.squeeze::<2>(2))
    }
}

pub struct DecoderStep<B: Backend> {
    /// `[batch, target_vocab_size]`
    pub logits: Tensor<B, 2>,
    /// `[batch, units]`
    pub hidden: Tensor<B, 2>,
    /// `[batch, source_len]`
    pub attention: Tensor<B, 2>,
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    embedding: Embedding<B>,
    norm: Option<BatchNorm<B, 1>>,
    attention: BahdanauAttention<B>,
    gru: Gru<B>,
    fc: Linear<B>,
}

impl<B: Backend> Decoder<B> {
    /// One decoding step for `token: [batch, 1]`, given the previous hidden
    /// state and the encoder outputs.
    pub fn forward(&self, token: Tensor<B, 2, Int>, hidden: Tensor<B, 2>, encoder_output: Tensor<B, 3>) -> DecoderStep<B> {
        let (context, attention) = self.attention.forward(hidden.clone(), encoder_output);

        let x = embed(&self.embedding, &self.norm, token);
        let x = Tensor::cat(vec![context.unsqueeze_dim::<3>(1), x], 2);

        let output = self.gru.forward(x, Some(hidden));
        let [batch_size, _, units] = output.dims();
        let hidden = output.reshape([batch_size, units]);

        DecoderStep {
            logits: self.fc.forward(hidden.clone()),
            hidden,
            attention,
        }
    }
}

/// GRU encoder-decoder with Bahdanau attention.
#[derive(Module, Debug)]
pub struct AttentionSeq2Seq<B: Backend> {
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
}

#[derive(Config, Debug)]
pub struct AttentionConfig {
    pub input_vocab_size: usize,
    pub target_vocab_size: usize,
    #[config(default = 256)]
    pub embedding_dim: usize,
    #[config(default = 1024)]
    pub units: usize,
    #[config(default = true)]
    pub batch_norm: bool,
}

impl AttentionConfig {
    fn init_norm<B: Backend>(&self, device: &B::Device) -> Option<BatchNorm<B, 1>> {
        self.batch_norm
            .then(|| BatchNormConfig::new(self.embedding_dim).init(device))
    }

    pub fn init_encoder<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        Encoder {
            embedding: EmbeddingConfig::new(self.input_vocab_size, self.embedding_dim).init(device),
            norm: self.init_norm(device),
            gru: GruConfig::new(self.embedding_dim, self.units, true).init(device),
        }
    }

    pub fn init_decoder<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        Decoder {
            embedding: EmbeddingConfig::new(self.target_vocab_size, self.embedding_dim).init(device),
            norm: self.init_norm(device),
            attention: BahdanauAttention {
                w1: LinearConfig::new(self.units, self.units).init(device),
                w2: LinearConfig::new(self.units, self.units).init(device),
                v: LinearConfig::new(self.units, 1).init(device),
            },
            gru: GruConfig::new(self.units + self.embedding_dim, self.units, true).init(device),
            fc: LinearConfig::new(self.units, self.target_vocab_size).init(device),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> AttentionSeq2Seq<B> {
        AttentionSeq2Seq {
            encoder: self.init_encoder(device),
            decoder: self.init_decoder(device),
        }
    }
}

impl<B: Backend> TranslationModel<B> for AttentionSeq2Seq<B> {
    /// Teacher forcing: the decoder always sees the true previous token.
    /// The masked per-step losses are summed and divided by the target
    /// length.
    fn forward_loss(&self, batch: TranslationBatch<B>) -> Tensor<B, 1> {
        let [batch_size, target_len] = batch.target.dims();
        let device = batch.target.device();

        let loss_fn = CrossEntropyLossConfig::new()
            .with_pad_tokens(Some(vec![PAD_ID as usize]))
            .init(&device);

        let (encoder_output, mut hidden) = self.encoder.forward(batch.source);
        let mut decoder_input = batch.target.clone().slice([0..batch_size, 0..1]);
        let mut loss = Tensor::<B, 1>::zeros([1], &device);

        for t in 1..target_len {
            let step = self
                .decoder
                .forward(decoder_input, hidden, encoder_output.clone());
            hidden = step.hidden;

            let real = batch.target.clone().slice([0..batch_size, t..t + 1]);
            loss = loss + loss_fn.forward(step.logits, real.clone().reshape([batch_size]));
            decoder_input = real;
        }

        loss / target_len as f64
    }
}

pub struct AttentionState<B: Backend> {
    encoder_output: Tensor<B, 3>,
    hidden: Tensor<B, 2>,
}

impl<B: Backend> GreedyDecoder for AttentionSeq2Seq<B> {
    type State = AttentionState<B>;

    fn begin(&self, source: &[u32]) -> Result<Self::State> {
        let device = self.decoder.fc.weight.device();
        let source = Tensor::<B, 1, Int>::from_ints(source, &device).unsqueeze::<2>();

        let (encoder_output, hidden) = self.encoder.forward(source);

        Ok(AttentionState {
            encoder_output,
            hidden,
        })
    }

    fn next_token(&self, state: &mut Self::State, prefix: &[u32]) -> Result<u32> {
        let Some(&last) = prefix.last() else {
            anyhow::bail!("Decoding needs at least the start token");
        };

        let device = state.hidden.device();
        let token = Tensor::<B, 1, Int>::from_ints([last], &device).unsqueeze::<2>();

        let step = self
            .decoder
            .forward(token, state.hidden.clone(), state.encoder_output.clone());
        state.hidden = step.hidden;

        Ok(argmax_last(step.logits))
    }
}
