use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use burn::prelude::*;
use log::{info, warn};

use crate::{
    checkpoint::CheckpointManager,
    decode::{GreedyDecoder, Translation, Translator},
    model::{ModelConfig, TransformerConfig},
    train::{CHECKPOINT_DIR, INPUT_VOCAB_FILE, MODEL_CONFIG_FILE, TARGET_VOCAB_FILE},
    vocab::SubwordVocab,
};

/// Checkpoints are pruned to this many whenever they are written.
pub const MAX_TO_KEEP: usize = 5;
/// Most tokens generated for one sentence.
pub const MAX_LENGTH: usize = 20;

#[derive(Clone, Debug)]
pub struct TranslateOptions {
    pub input_vocab: PathBuf,
    pub target_vocab: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub max_length: usize,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            input_vocab: PathBuf::from(INPUT_VOCAB_FILE),
            target_vocab: PathBuf::from(TARGET_VOCAB_FILE),
            checkpoint_dir: PathBuf::from(".").join(CHECKPOINT_DIR),
            max_length: MAX_LENGTH,
        }
    }
}

/// The saved model config, or a default Transformer sized for the given
/// vocabularies when the checkpoint directory has none.
pub fn load_model_config(
    options: &TranslateOptions,
    input_vocab: &SubwordVocab,
    target_vocab: &SubwordVocab,
) -> Result<ModelConfig> {
    let path = options.checkpoint_dir.join(MODEL_CONFIG_FILE);
    let expected = (input_vocab.model_vocab_size(), target_vocab.model_vocab_size());

    if !path.exists() {
        info!("No {} found, assuming a default Transformer", path.display());
        return Ok(ModelConfig::Transformer(TransformerConfig::new(expected.0, expected.1)));
    }

    let config = ModelConfig::load(&path).map_err(|e| anyhow!("Could not read {}: {e}", path.display()))?;
    if config.vocab_sizes() != expected {
        bail!(
            "Model was built for vocabularies {:?} but the given ones need {:?}",
            config.vocab_sizes(),
            expected
        );
    }

    Ok(config)
}

/// Restores the latest checkpoint into `model`. Without one the model keeps
/// its fresh weights, which is reported but not an error.
fn restore<B: Backend, M: Module<B>>(model: M, options: &TranslateOptions, device: &B::Device) -> Result<M> {
    if options.checkpoint_dir.is_dir() {
        let checkpoints = CheckpointManager::new(&options.checkpoint_dir, MAX_TO_KEEP)?;
        if checkpoints.latest_checkpoint().is_some() {
            return checkpoints.restore_model(model, device);
        }
    }

    warn!("No checkpoint in {}", options.checkpoint_dir.display());
    println!("No checkpoint found");
    Ok(model)
}

fn run<D: GreedyDecoder>(
    model: &D,
    input_vocab: &SubwordVocab,
    target_vocab: &SubwordVocab,
    options: &TranslateOptions,
    sentence: &str,
) -> Result<Translation> {
    Translator {
        model,
        input_vocab,
        target_vocab,
        max_length: options.max_length,
    }
    .translate(sentence)
}

/// Loads vocabularies and the latest checkpoint, then greedily translates
/// `sentence`.
pub fn translate<B: Backend>(options: &TranslateOptions, sentence: &str, device: B::Device) -> Result<Translation> {
    let input_vocab = SubwordVocab::load(&options.input_vocab)?;
    let target_vocab = SubwordVocab::load(&options.target_vocab)?;

    let model_config = load_model_config(options, &input_vocab, &target_vocab)?;
    info!("Translating with the {} model", model_config.name());

    match model_config {
        ModelConfig::Attention(c) => {
            let model = restore(c.init::<B>(&device), options, &device)?;
            run(&model, &input_vocab, &target_vocab, options, sentence)
        }
        ModelConfig::Transformer(c) => {
            if options.max_length > c.max_target_len() {
                bail!(
                    "Cannot generate {} tokens, the model decodes at most {}",
                    options.max_length,
                    c.max_target_len()
                );
            }

            let model = restore(c.init_transformer::<B>(&device), options, &device)?;
            run(&model, &input_vocab, &target_vocab, options, sentence)
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;

    use super::*;
    use crate::model::AttentionConfig;

    fn vocab(lines: &[&str]) -> SubwordVocab {
        SubwordVocab::build_from_corpus(lines, 100).unwrap()
    }

    #[test]
    fn missing_model_config_falls_back_to_a_transformer() {
        let dir = tempfile::tempdir().unwrap();
        let options = TranslateOptions {
            checkpoint_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let src = vocab(&["hello there"]);
        let tgt = vocab(&["bonjour"]);

        match load_model_config(&options, &src, &tgt).unwrap() {
            ModelConfig::Transformer(c) => {
                assert_eq!(c.input_vocab_size, src.model_vocab_size());
                assert_eq!(c.target_vocab_size, tgt.model_vocab_size());
                assert_eq!(c.num_layers, 6);
                assert_eq!(c.d_model, 512);
            }
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[test]
    fn mismatched_vocabularies_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let options = TranslateOptions {
            checkpoint_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let src = vocab(&["hello there"]);
        let tgt = vocab(&["bonjour"]);

        ModelConfig::Attention(AttentionConfig::new(src.model_vocab_size() + 1, tgt.model_vocab_size()))
            .save(dir.path().join(MODEL_CONFIG_FILE))
            .unwrap();

        assert!(load_model_config(&options, &src, &tgt).is_err());
    }

    fn options_with_vocabs(dir: &std::path::Path, src: &SubwordVocab, tgt: &SubwordVocab) -> TranslateOptions {
        let options = TranslateOptions {
            input_vocab: dir.join(INPUT_VOCAB_FILE),
            target_vocab: dir.join(TARGET_VOCAB_FILE),
            checkpoint_dir: dir.join(CHECKPOINT_DIR),
            max_length: 4,
        };
        src.save(&options.input_vocab).unwrap();
        tgt.save(&options.target_vocab).unwrap();

        options
    }

    fn tiny_transformer(src: &SubwordVocab, tgt: &SubwordVocab) -> TransformerConfig {
        TransformerConfig::new(src.model_vocab_size(), tgt.model_vocab_size())
            .with_num_layers(1)
            .with_d_model(8)
            .with_num_heads(2)
            .with_dff(16)
    }

    #[test]
    fn generation_longer_than_the_target_positions_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = vocab(&["hello there"]);
        let tgt = vocab(&["bonjour"]);
        let options = options_with_vocabs(dir.path(), &src, &tgt);
        std::fs::create_dir_all(&options.checkpoint_dir).unwrap();

        ModelConfig::Transformer(tiny_transformer(&src, &tgt).with_pe_target(Some(3)))
            .save(options.checkpoint_dir.join(MODEL_CONFIG_FILE))
            .unwrap();

        assert!(translate::<NdArray>(&options, "hello", Default::default()).is_err());
        let fits = TranslateOptions { max_length: 3, ..options };
        assert!(translate::<NdArray>(&fits, "hello", Default::default()).is_ok());
    }

    #[test]
    fn input_longer_than_the_source_positions_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = vocab(&["hello there"]);
        let tgt = vocab(&["bonjour"]);
        let options = options_with_vocabs(dir.path(), &src, &tgt);
        std::fs::create_dir_all(&options.checkpoint_dir).unwrap();

        ModelConfig::Transformer(tiny_transformer(&src, &tgt).with_pe_input(Some(4)))
            .save(options.checkpoint_dir.join(MODEL_CONFIG_FILE))
            .unwrap();

        assert!(translate::<NdArray>(&options, "hello there hello there", Default::default()).is_err());
    }

    #[test]
    fn a_missing_checkpoint_directory_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let src = vocab(&["hello there"]);
        let tgt = vocab(&["bonjour"]);
        let options = TranslateOptions {
            checkpoint_dir: dir.path().join("typo"),
            ..options_with_vocabs(dir.path(), &src, &tgt)
        };

        let model = tiny_transformer(&src, &tgt).init_transformer::<NdArray>(&Default::default());
        restore::<NdArray, _>(model, &options, &Default::default()).unwrap();

        assert!(!options.checkpoint_dir.exists());
    }

    #[test]
    fn defaults_point_at_training_artifacts() {
        let options = TranslateOptions::default();

        assert_eq!(options.input_vocab, PathBuf::from("tok_lang1.json"));
        assert_eq!(options.checkpoint_dir, PathBuf::from("./checkpoints/train"));
        assert_eq!(options.max_length, 20);
    }
}
