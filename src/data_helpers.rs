use std::num::NonZeroUsize;

use anyhow::{Result, bail};
use burn::{
    data::{
        dataloader::{BatchStrategy, batcher::Batcher},
        dataset::{Dataset, InMemDataset},
    },
    prelude::Backend,
    tensor::{Int, Tensor},
};
use log::{debug, info};

use crate::{
    corpus::SentencePair,
    vocab::{PAD_ID, SubwordVocab},
};

/// Emits fixed-size batches only. Whatever is left over when the loader
/// forces a flush is dropped.
pub struct DropRemainderBatchStrategy<T> {
    batch_size: NonZeroUsize,
    items: Vec<T>,
}

impl<T> DropRemainderBatchStrategy<T> {
    pub fn new(batch_size: NonZeroUsize) -> Self {
        Self {
            batch_size,
            items: Vec::with_capacity(batch_size.into()),
        }
    }
}

impl<T: Send + 'static> BatchStrategy<T> for DropRemainderBatchStrategy<T> {
    fn add(&mut self, item: T) {
        self.items.push(item);
    }

    fn batch(&mut self, force: bool) -> Option<Vec<T>> {
        let batch_size: usize = self.batch_size.into();

        if self.items.len() >= batch_size {
            return Some(self.items.drain(..batch_size).collect());
        }

        if force && !self.items.is_empty() {
            debug!("Dropping {} items of an incomplete batch", self.items.len());
            self.items.clear();
        }

        None
    }

    fn clone_dyn(&self) -> Box<dyn BatchStrategy<T>> {
        Box::new(Self::new(self.batch_size))
    }
}

/// An encoded sentence pair, markers included, not yet padded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationPair {
    pub source: Vec<u32>,
    pub target: Vec<u32>,
}

/// Encoded pairs together with the padded length of each side.
#[derive(Clone, Debug)]
pub struct TranslationCorpus {
    pub pairs: Vec<TranslationPair>,
    pub source_len: usize,
    pub target_len: usize,
}

impl TranslationCorpus {
    pub fn dataset(&self) -> InMemDataset<TranslationPair> {
        InMemDataset::new(self.pairs.clone())
    }

    pub fn batcher(&self) -> TranslationBatcher {
        TranslationBatcher::new(self.source_len, self.target_len)
    }
}

/// Encodes both sides with start/end markers and drops every pair where
/// either side is longer than `max_length` tokens.
pub fn encode_pairs(
    pairs: &[SentencePair],
    source_vocab: &SubwordVocab,
    target_vocab: &SubwordVocab,
    max_length: usize,
) -> Result<TranslationCorpus> {
    let mut encoded = Vec::with_capacity(pairs.len());

    for pair in pairs {
        let source = source_vocab.encode_with_markers(&pair.source)?;
        let target = target_vocab.encode_with_markers(&pair.target)?;

        if source.len() <= max_length && target.len() <= max_length {
            encoded.push(TranslationPair { source, target });
        }
    }

    if encoded.is_empty() {
        bail!("No sentence pair fits within {max_length} tokens");
    }

    let source_len = encoded.iter().map(|p| p.source.len()).max().unwrap_or(0);
    let target_len = encoded.iter().map(|p| p.target.len()).max().unwrap_or(0);

    info!(
        "Kept {} of {} pairs (source length {source_len}, target length {target_len})",
        encoded.len(),
        pairs.len()
    );

    Ok(TranslationCorpus {
        pairs: encoded,
        source_len,
        target_len,
    })
}

/// Appends padding until `ids` is `len` long. Longer input is left as is.
pub fn pad_sequence(ids: &[u32], len: usize) -> Vec<u32> {
    let mut padded = ids.to_vec();
    if padded.len() < len {
        padded.resize(len, PAD_ID);
    }

    padded
}

#[derive(Clone, Debug)]
pub struct TranslationBatch<B: Backend> {
    /// `[batch, source_len]`
    pub source: Tensor<B, 2, Int>,
    /// `[batch, target_len]`, starting with the start marker.
    pub target: Tensor<B, 2, Int>,
}

/// Pads every pair to the corpus-wide lengths so all batches share a shape.
#[derive(Clone, Debug)]
pub struct TranslationBatcher {
    source_len: usize,
    target_len: usize,
}

impl TranslationBatcher {
    pub fn new(source_len: usize, target_len: usize) -> Self {
        Self {
            source_len,
            target_len,
        }
    }
}

fn stack<B: Backend>(rows: Vec<Vec<u32>>, len: usize, device: &B::Device) -> Tensor<B, 2, Int> {
    let batch_size = rows.len();
    let flat: Vec<u32> = rows.into_iter().flatten().collect();

    Tensor::<B, 1, Int>::from_ints(flat.as_slice(), device).reshape([batch_size, len])
}

impl<B: Backend> Batcher<B, TranslationPair, TranslationBatch<B>> for TranslationBatcher {
    fn batch(&self, items: Vec<TranslationPair>, device: &B::Device) -> TranslationBatch<B> {
        let (sources, targets): (Vec<_>, Vec<_>) = items
            .iter()
            .map(|item| {
                (
                    pad_sequence(&item.source, self.source_len),
                    pad_sequence(&item.target, self.target_len),
                )
            })
            .unzip();

        TranslationBatch {
            source: stack(sources, self.source_len, device),
            target: stack(targets, self.target_len, device),
        }
    }
}

/// Number of full batches an epoch over `dataset` yields.
pub fn steps_per_epoch<D: Dataset<TranslationPair>>(dataset: &D, batch_size: usize) -> usize {
    dataset.len() / batch_size.max(1)
}

/// Worker count for a multi-threaded loader over `steps` full batches.
///
/// The loader hands each worker an equal contiguous share of the dataset and
/// every worker drops its own incomplete batch. When the count divides
/// `steps`, each share holds exactly `steps / workers` full batches plus less
/// than one batch in total across workers, so the epoch still yields `steps`
/// batches.
pub fn loader_workers(steps: usize, requested: usize) -> usize {
    (1..=requested.min(steps).max(1))
        .rev()
        .find(|workers| steps % workers == 0)
        .unwrap_or(1)
}
