use anyhow::Result;
use burn::prelude::*;
use log::debug;

use crate::vocab::SubwordVocab;

/// A model that can extend a target prefix one token at a time.
///
/// `begin` runs whatever only depends on the source sentence (the encoder),
/// `next_token` returns the most likely token to follow `prefix`.
pub trait GreedyDecoder {
    type State;

    fn begin(&self, source: &[u32]) -> Result<Self::State>;

    fn next_token(&self, state: &mut Self::State, prefix: &[u32]) -> Result<u32>;
}

/// Index of the largest logit of a `[1, vocab]` tensor.
pub fn argmax_last<B: Backend>(logits: Tensor<B, 2>) -> u32 {
    logits.argmax(1).into_scalar().elem::<i64>() as u32
}

/// Greedy autoregressive decoding.
///
/// The output starts as `[start]` and grows by one predicted token per step
/// for at most `max_length` steps. Predicting `end` stops decoding; the end
/// marker itself is not appended.
pub fn greedy_decode<D: GreedyDecoder>(
    decoder: &D,
    source: &[u32],
    start: u32,
    end: u32,
    max_length: usize,
) -> Result<Vec<u32>> {
    let mut state = decoder.begin(source)?;
    let mut output = vec![start];

    for _ in 0..max_length {
        let predicted = decoder.next_token(&mut state, &output)?;
        if predicted == end {
            return Ok(output);
        }

        output.push(predicted);
    }

    debug!("Stopped decoding after {max_length} tokens without an end marker");
    Ok(output)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    pub input: String,
    pub predicted: String,
    pub token_ids: Vec<u32>,
}

/// Ties a decoder to the vocabularies it was trained with.
pub struct Translator<'a, D> {
    pub model: &'a D,
    pub input_vocab: &'a SubwordVocab,
    pub target_vocab: &'a SubwordVocab,
    pub max_length: usize,
}

impl<D: GreedyDecoder> Translator<'_, D> {
    pub fn translate(&self, sentence: &str) -> Result<Translation> {
        let source = self.input_vocab.encode_with_markers(sentence)?;

        let token_ids = greedy_decode(
            self.model,
            &source,
            self.target_vocab.start_token(),
            self.target_vocab.end_token(),
            self.max_length,
        )?;

        let words: Vec<u32> = token_ids
            .iter()
            .copied()
            .filter(|&id| (id as usize) < self.target_vocab.vocab_size())
            .collect();

        Ok(Translation {
            input: sentence.to_string(),
            predicted: self.target_vocab.decode(&words)?,
            token_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Replays a fixed script and records every prefix it was asked about.
    struct Scripted {
        script: Vec<u32>,
        seen: RefCell<Vec<Vec<u32>>>,
    }

    impl Scripted {
        fn new(script: &[u32]) -> Self {
            Self {
                script: script.to_vec(),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl GreedyDecoder for Scripted {
        type State = usize;

        fn begin(&self, _source: &[u32]) -> Result<usize> {
            Ok(0)
        }

        fn next_token(&self, step: &mut usize, prefix: &[u32]) -> Result<u32> {
            self.seen.borrow_mut().push(prefix.to_vec());
            let token = self.script[*step];
            *step += 1;
            Ok(token)
        }
    }

    #[test]
    fn stops_at_the_end_marker_without_appending_it() {
        let model = Scripted::new(&[4, 5, 99, 6]);

        let output = greedy_decode(&model, &[1], 98, 99, 10).unwrap();

        assert_eq!(output, vec![98, 4, 5]);
        assert_eq!(
            *model.seen.borrow(),
            vec![vec![98], vec![98, 4], vec![98, 4, 5]]
        );
    }

    #[test]
    fn stops_after_max_length_steps() {
        let model = Scripted::new(&[4, 4, 4, 4, 4, 4]);

        let output = greedy_decode(&model, &[1], 98, 99, 3).unwrap();

        assert_eq!(output, vec![98, 4, 4, 4]);
    }

    #[test]
    fn zero_length_yields_the_start_marker_only() {
        let model = Scripted::new(&[]);

        assert_eq!(greedy_decode(&model, &[1], 98, 99, 0).unwrap(), vec![98]);
    }

    #[test]
    fn translation_drops_markers_before_decoding() {
        let lines = ["le chat est noir .", "le chien est blanc ."];
        let vocab = SubwordVocab::build_from_corpus(&lines, 100).unwrap();
        let words = vocab.encode("le chat est blanc .").unwrap();

        let mut script = words.clone();
        script.push(vocab.end_token());
        let model = Scripted::new(&script);

        let translator = Translator {
            model: &model,
            input_vocab: &vocab,
            target_vocab: &vocab,
            max_length: 20,
        };
        let translation = translator.translate("le chien").unwrap();

        assert_eq!(translation.input, "le chien");
        assert_eq!(translation.predicted, "le chat est blanc .");
        assert_eq!(translation.token_ids[0], vocab.start_token());
        assert_eq!(&translation.token_ids[1..], words.as_slice());
    }

    #[test]
    fn argmax_picks_the_largest_logit() {
        use burn::backend::NdArray;

        let logits = Tensor::<NdArray, 1>::from_floats([0.1, 2.0, -1.0, 0.5], &Default::default())
            .unsqueeze::<2>();

        assert_eq!(argmax_last(logits), 1);
    }
}
