use anyhow::{Result, bail};
use burn::{
    nn::{
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig, PositionalEncoding,
        PositionalEncodingConfig,
        loss::CrossEntropyLossConfig,
        transformer::{
            TransformerDecoder, TransformerDecoderConfig, TransformerDecoderInput, TransformerEncoder,
            TransformerEncoderConfig, TransformerEncoderInput,
        },
    },
    prelude::*,
    tensor::{Bool, s},
};

use crate::{
    data_helpers::TranslationBatch,
    decode::{GreedyDecoder, argmax_last},
    masks::{Masks, create_masks, padding_mask},
    model::TranslationModel,
    vocab::PAD_ID,
};

#[derive(Module, Debug)]
pub struct Transformer<B: Backend> {
    input_emb: Embedding<B>,
    input_pos: PositionalEncoding<B>,
    target_emb: Embedding<B>,
    target_pos: PositionalEncoding<B>,
    dropout: Dropout,
    encoder: TransformerEncoder<B>,
    decoder: TransformerDecoder<B>,
    unembed: Linear<B>,
    d_model: usize,
    max_source_len: usize,
    max_target_len: usize,
}

impl<B: Backend> Transformer<B> {
    fn embed(&self, emb: &Embedding<B>, pos: &PositionalEncoding<B>, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let x_tok_emb = emb.forward(tokens) * (self.d_model as f64).sqrt();
        let x_pos_enc = pos.forward(x_tok_emb);

        self.dropout.forward(x_pos_enc)
    }

    /// `[batch, src_len] -> [batch, src_len, d_model]`
    pub fn encode(&self, inp: Tensor<B, 2, Int>, padding: Tensor<B, 2, Bool>) -> Tensor<B, 3> {
        let x = self.embed(&self.input_emb, &self.input_pos, inp);

        self.encoder
            .forward(TransformerEncoderInput::new(x).mask_pad(padding))
    }

    /// Logits for every target position, `[batch, tgt_len, target_vocab_size]`.
    pub fn decode(&self, tar: Tensor<B, 2, Int>, memory: Tensor<B, 3>, masks: Masks<B>) -> Tensor<B, 3> {
        let y = self.embed(&self.target_emb, &self.target_pos, tar);

        let y_dec = self.decoder.forward(
            TransformerDecoderInput::new(y, memory)
                .target_mask_attn(masks.combined)
                .memory_mask_pad(masks.decoder_padding),
        );

        self.unembed.forward(y_dec)
    }

    pub fn forward(&self, inp: Tensor<B, 2, Int>, tar: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let masks = create_masks(&inp, &tar);
        let memory = self.encode(inp, masks.encoder_padding.clone());

        self.decode(tar, memory, masks)
    }
}

impl<B: Backend> TranslationModel<B> for Transformer<B> {
    /// Predicts `target[:, 1..]` from `target[:, ..-1]`.
    fn forward_loss(&self, batch: TranslationBatch<B>) -> Tensor<B, 1> {
        let tar_inp = batch.target.clone().slice(s![.., ..-1]);
        let tar_real = batch.target.slice(s![.., 1..]);

        let y_hat = self.forward(batch.source, tar_inp);
        let y_hat_flattened = y_hat.flatten::<2>(0, 1);

        let [n, _] = y_hat_flattened.dims();
        let y_gt_reshaped = tar_real.reshape([n]);

        CrossEntropyLossConfig::new()
            .with_pad_tokens(Some(vec![PAD_ID as usize]))
            .init(&y_hat_flattened.device())
            .forward(y_hat_flattened, y_gt_reshaped)
    }
}

pub struct TransformerState<B: Backend> {
    inp: Tensor<B, 2, Int>,
    memory: Tensor<B, 3>,
}

impl<B: Backend> GreedyDecoder for Transformer<B> {
    type State = TransformerState<B>;

    fn begin(&self, source: &[u32]) -> Result<Self::State> {
        if source.len() > self.max_source_len {
            bail!(
                "Input of {} tokens is longer than the {} positions the model encodes",
                source.len(),
                self.max_source_len
            );
        }

        let device = self.unembed.weight.device();
        let inp = Tensor::<B, 1, Int>::from_ints(source, &device).unsqueeze::<2>();
        let memory = self.encode(inp.clone(), padding_mask(inp.clone()));

        Ok(TransformerState { inp, memory })
    }

    fn next_token(&self, state: &mut Self::State, prefix: &[u32]) -> Result<u32> {
        if prefix.len() > self.max_target_len {
            bail!(
                "Output of {} tokens is longer than the {} positions the model decodes",
                prefix.len(),
                self.max_target_len
            );
        }
        let tar = Tensor::<B, 1, Int>::from_ints(prefix, &state.inp.device()).unsqueeze::<2>();
        let masks = create_masks(&state.inp, &tar);

        let logits = self.decode(tar, state.memory.clone(), masks);
        let [_, len, vocab] = logits.dims();
        let last = logits.slice([0..1, len - 1..len, 0..vocab]).reshape([1, vocab]);

        Ok(argmax_last(last))
    }
}

#[derive(Config, Debug)]
pub struct TransformerConfig {
    pub input_vocab_size: usize,
    pub target_vocab_size: usize,
    #[config(default = 6)]
    pub num_layers: usize,
    #[config(default = 512)]
    pub d_model: usize,
    #[config(default = 8)]
    pub num_heads: usize,
    #[config(default = 2048)]
    pub dff: usize,
    /// Longest source sequence the positional encoding covers. Defaults to
    /// the input vocabulary size.
    #[config(default = "None")]
    pub pe_input: Option<usize>,
    /// Same for target sequences, defaulting to the target vocabulary size.
    #[config(default = "None")]
    pub pe_target: Option<usize>,
    #[config(default = 0.1)]
    pub dropout: f64,
}

impl TransformerConfig {
    /// Longest source sequence, markers included, the model can encode.
    pub fn max_source_len(&self) -> usize {
        self.pe_input.unwrap_or(self.input_vocab_size)
    }

    /// Longest target prefix the model can decode.
    pub fn max_target_len(&self) -> usize {
        self.pe_target.unwrap_or(self.target_vocab_size)
    }

    pub fn init_encoder<B: Backend>(&self, device: &B::Device) -> TransformerEncoder<B> {
        TransformerEncoderConfig::new(self.d_model, self.dff, self.num_heads, self.num_layers)
            .with_dropout(self.dropout)
            .init(device)
    }

    pub fn init_decoder<B: Backend>(&self, device: &B::Device) -> TransformerDecoder<B> {
        TransformerDecoderConfig::new(self.d_model, self.dff, self.num_heads, self.num_layers)
            .with_dropout(self.dropout)
            .init(device)
    }

    pub fn init_transformer<B: Backend>(&self, device: &B::Device) -> Transformer<B> {
        let pe_input = self.max_source_len();
        let pe_target = self.max_target_len();

        Transformer {
            input_emb: EmbeddingConfig::new(self.input_vocab_size, self.d_model).init(device),
            input_pos: PositionalEncodingConfig::new(self.d_model)
                .with_max_sequence_size(pe_input)
                .init(device),
            target_emb: EmbeddingConfig::new(self.target_vocab_size, self.d_model).init(device),
            target_pos: PositionalEncodingConfig::new(self.d_model)
                .with_max_sequence_size(pe_target)
                .init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            encoder: self.init_encoder(device),
            decoder: self.init_decoder(device),
            unembed: LinearConfig::new(self.d_model, self.target_vocab_size).init(device),
            d_model: self.d_model,
            max_source_len: pe_input,
            max_target_len: pe_target,
        }
    }
}
