use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};

const INDEX_FILE: &str = "checkpoint.json";
const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";

/// Bookkeeping of which numbered checkpoints exist on disk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    /// Number of checkpoints ever written; the next one gets this + 1.
    pub save_counter: usize,
    /// Checkpoint numbers still on disk, oldest first.
    pub kept: Vec<usize>,
}

impl CheckpointIndex {
    /// Allocates the next checkpoint number and returns it along with the
    /// numbers that fall out of the `max_to_keep` window.
    pub fn push(&mut self, max_to_keep: usize) -> (usize, Vec<usize>) {
        self.save_counter += 1;
        self.kept.push(self.save_counter);

        let excess = self.kept.len().saturating_sub(max_to_keep.max(1));
        let evicted = self.kept.drain(..excess).collect();

        (self.save_counter, evicted)
    }

    pub fn latest(&self) -> Option<usize> {
        self.kept.last().copied()
    }
}

/// Numbered checkpoints (`ckpt-1`, `ckpt-2`, ...) in one directory, of which
/// only the newest `max_to_keep` are retained.
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
    index: CheckpointIndex,
}

impl CheckpointManager {
    /// Opens `dir`, creating it if needed, and picks up an existing index.
    pub fn new(dir: impl Into<PathBuf>, max_to_keep: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Could not create checkpoint dir {}", dir.display()))?;

        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.exists() {
            let json = fs::read_to_string(&index_path)
                .with_context(|| format!("Could not read {}", index_path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("Malformed checkpoint index {}", index_path.display()))?
        } else {
            CheckpointIndex::default()
        };

        Ok(Self {
            dir,
            max_to_keep,
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn checkpoint_dir(&self, number: usize) -> PathBuf {
        self.dir.join(format!("ckpt-{number}"))
    }

    pub fn latest_checkpoint(&self) -> Option<PathBuf> {
        self.index.latest().map(|n| self.checkpoint_dir(n))
    }

    fn write_index(&self, index: &CheckpointIndex) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        fs::write(&path, serde_json::to_string_pretty(index)?)
            .with_context(|| format!("Could not write {}", path.display()))
    }

    /// Writes the next checkpoint through `write`. Only once that succeeded
    /// is it added to the index and are checkpoints beyond `max_to_keep`
    /// removed; a failed write leaves both untouched.
    fn commit(&mut self, write: impl FnOnce(&Path) -> Result<()>) -> Result<PathBuf> {
        let mut index = self.index.clone();
        let (number, evicted) = index.push(self.max_to_keep);

        let ckpt_dir = self.checkpoint_dir(number);
        fs::create_dir_all(&ckpt_dir)
            .with_context(|| format!("Could not create {}", ckpt_dir.display()))?;

        if let Err(err) = write(&ckpt_dir) {
            fs::remove_dir_all(&ckpt_dir).ok();
            return Err(err);
        }

        self.write_index(&index)?;
        self.index = index;

        for old in evicted {
            let old_dir = self.checkpoint_dir(old);
            debug!("Removing old checkpoint {}", old_dir.display());
            fs::remove_dir_all(&old_dir).ok();
        }

        info!("Checkpoint saved to {}", ckpt_dir.display());
        Ok(ckpt_dir)
    }

    fn write_model<B: Backend, M: Module<B>>(model: &M, ckpt_dir: &Path) -> Result<()> {
        model
            .clone()
            .save_file(ckpt_dir.join(MODEL_FILE), &CompactRecorder::new())
            .with_context(|| format!("Could not save model to {}", ckpt_dir.display()))
    }

    /// Saves model weights only.
    pub fn save_model<B: Backend, M: Module<B>>(&mut self, model: &M) -> Result<PathBuf> {
        self.commit(|ckpt_dir| Self::write_model::<B, M>(model, ckpt_dir))
    }

    /// Saves model weights and optimizer state together.
    pub fn save<B, M, O>(&mut self, model: &M, optim: &O) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        self.commit(|ckpt_dir| {
            Self::write_model::<B, M>(model, ckpt_dir)?;
            Recorder::<B>::record(&CompactRecorder::new(), optim.to_record(), ckpt_dir.join(OPTIMIZER_FILE))
                .with_context(|| format!("Could not save optimizer to {}", ckpt_dir.display()))?;

            Ok(())
        })
    }

    /// Loads the weights of the latest checkpoint into `model`.
    pub fn restore_model<B: Backend, M: Module<B>>(&self, model: M, device: &B::Device) -> Result<M> {
        let ckpt_dir = self
            .latest_checkpoint()
            .with_context(|| format!("No checkpoint in {}", self.dir.display()))?;

        let model = model
            .load_file(ckpt_dir.join(MODEL_FILE), &CompactRecorder::new(), device)
            .with_context(|| format!("Could not restore model from {}", ckpt_dir.display()))?;

        info!("Restored model from {}", ckpt_dir.display());
        Ok(model)
    }

    /// Loads the optimizer state of the latest checkpoint into `optim`.
    pub fn restore_optimizer<B, M, O>(&self, optim: O, device: &B::Device) -> Result<O>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let ckpt_dir = self
            .latest_checkpoint()
            .with_context(|| format!("No checkpoint in {}", self.dir.display()))?;

        let record = Recorder::<B>::load(&CompactRecorder::new(), ckpt_dir.join(OPTIMIZER_FILE), device)
            .with_context(|| format!("Could not restore optimizer from {}", ckpt_dir.display()))?;

        Ok(optim.load_record(record))
    }
}

#[cfg(test)]
mod tests {
    use burn::{
        backend::{Autodiff, NdArray},
        optim::{AdamConfig, GradientsParams},
    };

    use super::*;
    use crate::model::{AttentionConfig, AttentionSeq2Seq};

    type TestBackend = NdArray;

    fn tiny<B: Backend>() -> AttentionSeq2Seq<B> {
        AttentionConfig::new(6, 6)
            .with_embedding_dim(4)
            .with_units(4)
            .with_batch_norm(false)
            .init(&Default::default())
    }

    fn weights<B: Backend>(model: &AttentionSeq2Seq<B>) -> Vec<f32> {
        model
            .decoder
            .forward(
                Tensor::from_ints([[1]], &Default::default()),
                Tensor::zeros([1, 4], &Default::default()),
                Tensor::ones([1, 2, 4], &Default::default()),
            )
            .logits
            .into_data()
            .convert::<f32>()
            .to_vec()
            .unwrap()
    }

    #[test]
    fn index_keeps_a_sliding_window() {
        let mut index = CheckpointIndex::default();

        assert_eq!(index.push(2), (1, vec![]));
        assert_eq!(index.push(2), (2, vec![]));
        assert_eq!(index.push(2), (3, vec![1]));
        assert_eq!(index.kept, vec![2, 3]);
        assert_eq!(index.latest(), Some(3));
    }

    #[test]
    fn empty_directory_has_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("train"), 5).unwrap();

        assert!(manager.latest_checkpoint().is_none());
        assert!(
            manager
                .restore_model(tiny::<TestBackend>(), &Default::default())
                .is_err()
        );
    }

    #[test]
    fn old_checkpoints_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path(), 2).unwrap();
        let model = tiny::<TestBackend>();

        for _ in 0..3 {
            manager.save_model(&model).unwrap();
        }

        assert!(!dir.path().join("ckpt-1").exists());
        assert!(dir.path().join("ckpt-2").exists());
        assert_eq!(manager.latest_checkpoint(), Some(dir.path().join("ckpt-3")));
    }

    #[test]
    fn a_failed_write_keeps_earlier_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path(), 1).unwrap();
        let model = tiny::<TestBackend>();
        manager.save_model(&model).unwrap();

        let failed = manager.commit(|_| anyhow::bail!("disk full"));

        assert!(failed.is_err());
        assert!(dir.path().join("ckpt-1").exists());
        assert!(!dir.path().join("ckpt-2").exists());
        assert_eq!(manager.latest_checkpoint(), Some(dir.path().join("ckpt-1")));

        let reopened = CheckpointManager::new(dir.path(), 1).unwrap();
        assert_eq!(reopened.latest_checkpoint(), Some(dir.path().join("ckpt-1")));
        assert!(reopened.restore_model(tiny::<TestBackend>(), &Default::default()).is_ok());
    }

    #[test]
    fn restored_weights_match_saved_weights() {
        let dir = tempfile::tempdir().unwrap();
        let saved = tiny::<TestBackend>();
        CheckpointManager::new(dir.path(), 5)
            .unwrap()
            .save_model(&saved)
            .unwrap();

        // a fresh manager reads the index from disk
        let manager = CheckpointManager::new(dir.path(), 5).unwrap();
        let restored = manager
            .restore_model(tiny::<TestBackend>(), &Default::default())
            .unwrap();

        // weights are stored in half precision
        for (a, b) in weights(&saved).iter().zip(weights(&restored).iter()) {
            assert!((a - b).abs() < 1e-2, "{a} != {b}");
        }
    }

    #[test]
    fn optimizer_state_round_trips() {
        type Ad = Autodiff<TestBackend>;
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let model = tiny::<Ad>();
        let mut optim = AdamConfig::new().init();
        let loss = model
            .decoder
            .forward(
                Tensor::from_ints([[1]], &device),
                Tensor::zeros([1, 4], &device),
                Tensor::ones([1, 2, 4], &device),
            )
            .logits
            .sum();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let model = optim.step(1e-3, model, grads);

        let mut manager = CheckpointManager::new(dir.path(), 5).unwrap();
        manager.save(&model, &optim).unwrap();

        let fresh = AdamConfig::new().init::<Ad, AttentionSeq2Seq<Ad>>();
        assert!(manager.restore_optimizer(fresh, &device).is_ok());
    }
}
