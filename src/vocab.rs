use std::{collections::HashSet, path::Path};

use anyhow::{Result, anyhow, bail};
use log::{debug, info};
use tokenizers::{
    AddedToken, Tokenizer,
    models::{TrainerWrapper, bpe::{BPE, BpeTrainerBuilder}},
    pre_tokenizers::byte_level::ByteLevel,
};

/// Reserved at id 0 in every vocabulary; sequences are padded with it.
pub const PAD_TOKEN: &str = "<pad>";
pub const PAD_ID: u32 = 0;

/// A subword vocabulary for one language.
///
/// Ids `0..vocab_size()` belong to the tokenizer, `0` being padding. The two
/// ids right after it mark the start and the end of a sentence, which is why
/// models are sized with [`SubwordVocab::model_vocab_size`].
#[derive(Clone)]
pub struct SubwordVocab {
    tokenizer: Tokenizer,
}

impl SubwordVocab {
    /// Learns a byte-level BPE vocabulary of roughly `target_vocab_size`
    /// entries. All 256 byte symbols are always part of it, so any text can
    /// be encoded, even characters the corpus never contained.
    pub fn build_from_corpus<S>(lines: &[S], target_vocab_size: usize) -> Result<Self>
    where
        S: AsRef<str> + Send + Sync,
    {
        let mut trainer: TrainerWrapper = BpeTrainerBuilder::new()
            .vocab_size(target_vocab_size)
            .show_progress(false)
            .special_tokens(vec![AddedToken::from(PAD_TOKEN, true)])
            .initial_alphabet(ByteLevel::alphabet().into_iter().collect::<HashSet<char>>())
            .build()
            .into();

        let byte_level = ByteLevel::new(false, true, true);
        let mut tokenizer = Tokenizer::new(BPE::default());
        tokenizer.with_pre_tokenizer(Some(byte_level));
        tokenizer.with_decoder(Some(byte_level));
        tokenizer
            .train(&mut trainer, lines.iter().map(|line| line.as_ref()))
            .map_err(|e| anyhow!(e))?;

        Self::from_tokenizer(tokenizer)
    }

    pub fn from_tokenizer(tokenizer: Tokenizer) -> Result<Self> {
        match tokenizer.token_to_id(PAD_TOKEN) {
            Some(PAD_ID) => {}
            Some(other) => bail!("{PAD_TOKEN} has id {other}, expected {PAD_ID}"),
            None => bail!("Vocabulary has no {PAD_TOKEN} entry"),
        }

        let vocab = Self { tokenizer };
        debug!("Vocabulary ready with {} entries", vocab.vocab_size());

        Ok(vocab)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Could not load vocabulary {}: {e}", path.display()))?;

        Self::from_tokenizer(tokenizer)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.tokenizer
            .save(path, false)
            .map_err(|e| anyhow!("Could not save vocabulary {}: {e}", path.display()))?;

        info!("Saved vocabulary to {}", path.display());
        Ok(())
    }

    /// Number of tokenizer entries, padding included.
    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn start_token(&self) -> u32 {
        self.vocab_size() as u32
    }

    pub fn end_token(&self) -> u32 {
        self.vocab_size() as u32 + 1
    }

    /// Embedding/projection size for a model using this vocabulary.
    pub fn model_vocab_size(&self) -> usize {
        self.vocab_size() + 2
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!(e))?;

        Ok(encoding.get_ids().to_vec())
    }

    /// `[start] ++ encode(text) ++ [end]`
    pub fn encode_with_markers(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        ids.push(self.start_token());
        ids.extend(self.encode(text)?);
        ids.push(self.end_token());

        Ok(ids)
    }

    /// Decodes tokenizer ids back to text. Padding is skipped; markers and
    /// any other out-of-vocabulary ids must be filtered out by the caller.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer.decode(ids, true).map_err(|e| anyhow!(e))
    }
}
