use burn::{
    nn::attention::generate_autoregressive_mask,
    prelude::Backend,
    tensor::{Bool, Int, Tensor},
};

use crate::vocab::PAD_ID;

/// `true` wherever `tokens` holds padding. `[batch, len] -> [batch, len]`
pub fn padding_mask<B: Backend>(tokens: Tensor<B, 2, Int>) -> Tensor<B, 2, Bool> {
    tokens.equal_elem(PAD_ID as i32)
}

/// `true` above the diagonal, i.e. for every future position.
pub fn look_ahead_mask<B: Backend>(batch_size: usize, len: usize, device: &B::Device) -> Tensor<B, 3, Bool> {
    generate_autoregressive_mask(batch_size, len, device)
}

/// Every mask one encoder-decoder forward pass needs.
#[derive(Clone, Debug)]
pub struct Masks<B: Backend> {
    /// Source padding for encoder self-attention, `[batch, src_len]`.
    pub encoder_padding: Tensor<B, 2, Bool>,
    /// Look-ahead OR target padding for decoder self-attention,
    /// `[batch, tgt_len, tgt_len]`.
    pub combined: Tensor<B, 3, Bool>,
    /// Source padding for decoder cross-attention, `[batch, src_len]`.
    pub decoder_padding: Tensor<B, 2, Bool>,
}

pub fn create_masks<B: Backend>(inp: &Tensor<B, 2, Int>, tar: &Tensor<B, 2, Int>) -> Masks<B> {
    let [batch_size, tgt_len] = tar.dims();

    let encoder_padding = padding_mask(inp.clone());
    let decoder_padding = encoder_padding.clone();

    let look_ahead = look_ahead_mask::<B>(batch_size, tgt_len, &tar.device());
    let target_padding = padding_mask(tar.clone())
        .unsqueeze_dim::<3>(1)
        .expand([batch_size, tgt_len, tgt_len]);
    let combined = look_ahead.bool_or(target_padding);

    Masks {
        encoder_padding,
        combined,
        decoder_padding,
    }
}
