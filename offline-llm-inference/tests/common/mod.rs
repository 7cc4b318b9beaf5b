#![allow(dead_code)]

use std::path::{Path, PathBuf};

use offline_llm_inference::checkpoint::{CheckpointConfig, DecoderWeights, VocabEntry, write_checkpoint};
use offline_llm_inference::{Architecture, LoadConfig, ModelHandle, Quantization, load_model};
use tempfile::TempDir;

pub const GROUP_SIZE: usize = 4;

/// Model file in a temporary directory, removed on drop.
pub struct Fixture {
    _dir: TempDir,
    pub path: PathBuf,
}

impl Fixture {
    pub fn load(&self) -> ModelHandle {
        self.load_with(LoadConfig::default())
    }

    pub fn load_with(&self, config: LoadConfig) -> ModelHandle {
        load_model(&self.path, config).expect("fixture model loads")
    }
}

/// Describes a model whose greedy continuation of token `i` is `successors[i]`.
pub struct SuccessorModel<'a> {
    pub vocab: &'a [&'a [u8]],
    pub successors: &'a [usize],
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub quantization: Quantization,
    pub architecture: Architecture,
    pub seq_len: usize,
}

impl SuccessorModel<'_> {
    pub fn config(&self) -> CheckpointConfig {
        CheckpointConfig {
            quantization: self.quantization,
            architecture: self.architecture,
            dim: self.vocab.len().next_multiple_of(GROUP_SIZE),
            hidden_dim: GROUP_SIZE,
            n_layers: 1,
            n_heads: 1,
            n_kv_heads: 1,
            head_dim: GROUP_SIZE,
            seq_len: self.seq_len,
            group_size: GROUP_SIZE,
            shared_classifier: false,
            bos_token_id: self.bos_token_id,
            eos_token_id: self.eos_token_id,
            rope_theta: 10000.0,
            norm_eps: 1e-5,
        }
    }

    /// One-hot embeddings pass through zeroed layers unchanged, so the
    /// classifier alone decides the next token.
    pub fn weights(&self) -> DecoderWeights {
        let config = self.config();
        let dim = config.dim;
        let mut weights = DecoderWeights::zeros(&config, self.vocab.len());

        for (token, &successor) in self.successors.iter().enumerate() {
            weights.token_embedding[token * dim + token] = 1.0;
            weights.wcls[successor * dim + token] = 1.0;
        }

        weights
    }

    pub fn write_to(&self, path: &Path) {
        let vocab: Vec<VocabEntry> = self.vocab.iter().map(|bytes| VocabEntry::new(*bytes, 0.0)).collect();
        write_checkpoint(path, &self.config(), &vocab, &self.weights()).expect("fixture model is written");
    }

    pub fn write(&self) -> Fixture {
        let dir = tempfile::tempdir().expect("temp dir is created");
        let path = dir.path().join("model.bin");
        self.write_to(&path);
        Fixture { _dir: dir, path }
    }
}

pub const ABC_VOCAB: [&[u8]; 4] = [b"a", b"b", b"c", b"</s>"];

/// `a -> b -> c -> a`; the end-of-sequence token is never predicted.
pub fn abc_model(seq_len: usize) -> SuccessorModel<'static> {
    SuccessorModel {
        vocab: &ABC_VOCAB,
        successors: &[1, 2, 0, 0],
        bos_token_id: None,
        eos_token_id: Some(3),
        quantization: Quantization::Q8_0,
        architecture: Architecture::QkNormDecoder,
        seq_len,
    }
}

pub fn abc_fixture() -> Fixture {
    abc_model(64).write()
}

/// `a -> b -> </s>`.
pub fn abc_ending_fixture() -> Fixture {
    SuccessorModel { successors: &[1, 3, 0, 0], ..abc_model(64) }.write()
}

pub const EMOJI_VOCAB: [&[u8]; 6] = [b"x", &[0xF0], &[0x9F], &[0x98], &[0x80], b"</s>"];

/// `x` continues with the four bytes of U+1F600 one token at a time, then ends.
pub fn emoji_fixture() -> Fixture {
    SuccessorModel {
        vocab: &EMOJI_VOCAB,
        successors: &[1, 2, 3, 4, 5, 0],
        bos_token_id: None,
        eos_token_id: Some(5),
        quantization: Quantization::Q8_0,
        architecture: Architecture::Decoder,
        seq_len: 32,
    }
    .write()
}
