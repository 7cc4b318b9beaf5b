//! Writer for the runtime's own model file format.
//!
//! Used to produce fixtures and synthetic models; weights are supplied as `f32`
//! and quantized to Q8_0 on the way out when requested.

#[cfg(test)]
#[path = "../tests/unit/checkpoint_test.rs"]
mod tests;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use byteorder::{LittleEndian, WriteBytesExt};
use rayon::prelude::*;

use crate::configuration::*;
use crate::context::XorShiftRng;
use crate::tokenizer::TokenId;

/// Hyperparameters written into the header.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub quantization: Quantization,
    pub architecture: Architecture,
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub seq_len: usize,
    pub group_size: usize,
    pub shared_classifier: bool,
    pub bos_token_id: Option<TokenId>,
    pub eos_token_id: Option<TokenId>,
    pub rope_theta: f32,
    pub norm_eps: f32,
}

impl CheckpointConfig {
    fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    fn all_heads_dim(&self) -> usize {
        self.n_heads * self.head_dim
    }
}

/// One vocabulary entry.
#[derive(Debug, Clone, PartialEq)]
pub struct VocabEntry {
    pub bytes: Vec<u8>,
    pub score: f32,
}

impl VocabEntry {
    pub fn new(bytes: impl Into<Vec<u8>>, score: f32) -> Self {
        Self { bytes: bytes.into(), score }
    }
}

/// Full precision weights in file order. Matrices are row-major `[out, in]`,
/// one entry per layer.
#[derive(Debug, Clone)]
pub struct DecoderWeights {
    pub rms_att: Vec<f32>,
    pub rms_ffn: Vec<f32>,
    pub rms_final: Vec<f32>,
    pub q_norm: Vec<f32>,
    pub k_norm: Vec<f32>,
    pub token_embedding: Vec<f32>,
    pub wq: Vec<Vec<f32>>,
    pub wk: Vec<Vec<f32>>,
    pub wv: Vec<Vec<f32>>,
    pub wo: Vec<Vec<f32>>,
    pub w1: Vec<Vec<f32>>,
    pub w2: Vec<Vec<f32>>,
    pub w3: Vec<Vec<f32>>,
    /// Ignored when the classifier is shared with the embeddings.
    pub wcls: Vec<f32>,
}

impl DecoderWeights {
    /// Unit norms and all-zero matrices.
    pub fn zeros(config: &CheckpointConfig, vocab_size: usize) -> Self {
        Self::filled(config, vocab_size, |_| 0.0)
    }

    /// Unit norms and matrices drawn uniformly from `[-scale, scale)`.
    pub fn seeded(config: &CheckpointConfig, vocab_size: usize, seed: u64, scale: f32) -> Self {
        let mut rng = XorShiftRng::new(seed);
        Self::filled(config, vocab_size, |_| (rng.next_f32() * 2.0 - 1.0) * scale)
    }

    fn filled(config: &CheckpointConfig, vocab_size: usize, mut value: impl FnMut(usize) -> f32) -> Self {
        let CheckpointConfig { dim, hidden_dim, n_layers, head_dim, .. } = *config;
        let all_heads_dim = config.all_heads_dim();
        let kv_dim = config.kv_dim();

        let mut matrix = |len: usize| (0..len).map(&mut value).collect::<Vec<f32>>();
        let mut layers = |len: usize| (0..n_layers).map(|_| matrix(len)).collect::<Vec<_>>();

        let wq = layers(dim * all_heads_dim);
        let wk = layers(dim * kv_dim);
        let wv = layers(dim * kv_dim);
        let wo = layers(all_heads_dim * dim);
        let w1 = layers(dim * hidden_dim);
        let w2 = layers(hidden_dim * dim);
        let w3 = layers(dim * hidden_dim);

        let mut matrix = |len: usize| (0..len).map(&mut value).collect::<Vec<f32>>();
        let token_embedding = matrix(vocab_size * dim);
        let wcls = if config.shared_classifier { Vec::new() } else { matrix(vocab_size * dim) };

        Self {
            rms_att: vec![1.0; n_layers * dim],
            rms_ffn: vec![1.0; n_layers * dim],
            rms_final: vec![1.0; dim],
            q_norm: vec![1.0; n_layers * head_dim],
            k_norm: vec![1.0; n_layers * head_dim],
            token_embedding,
            wq,
            wk,
            wv,
            wo,
            w1,
            w2,
            w3,
            wcls,
        }
    }
}

/// Q8_0 matrix: int8 values and one scale per group.
#[derive(Debug)]
pub struct QuantizedWeight {
    pub int8_data: Vec<i8>,
    pub scales: Vec<f32>,
    pub max_error: f32,
}

/// Quantizes weights to Q8_0 (symmetric int8, range [-127, 127], round half to even).
pub fn quantize_q80(weights: &[f32], group_size: usize) -> Result<QuantizedWeight> {
    ensure!(group_size > 0 && weights.len() % group_size == 0, "weight length is not a multiple of group_size");

    let group_results: Vec<_> = weights
        .par_chunks(group_size)
        .map(|group| {
            let group_max = group.iter().map(|&x| x.abs()).fold(0.0f32, f32::max);
            let scale = if group_max > 0.0 { group_max / 127.0 } else { 1.0 };

            let mut group_error = 0.0f32;
            let group_int8: Vec<i8> = group
                .iter()
                .map(|&weight| {
                    let quantized = (weight / scale).round_ties_even().clamp(-127.0, 127.0) as i8;
                    group_error = group_error.max((f32::from(quantized) * scale - weight).abs());
                    quantized
                })
                .collect();

            (group_int8, scale, group_error)
        })
        .collect();

    let mut int8_data = Vec::with_capacity(weights.len());
    let mut scales = Vec::with_capacity(group_results.len());
    let mut max_error = 0.0f32;

    for (group_int8, scale, group_error) in group_results {
        int8_data.extend(group_int8);
        scales.push(scale);
        max_error = max_error.max(group_error);
    }

    Ok(QuantizedWeight { int8_data, scales, max_error })
}

/// Writes a complete model file.
pub fn write_checkpoint(
    path: &Path,
    config: &CheckpointConfig,
    vocab: &[VocabEntry],
    weights: &DecoderWeights,
) -> Result<()> {
    validate(config, vocab, weights)?;

    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let vocab_table_bytes: usize = vocab.iter().map(|entry| 8 + entry.bytes.len()).sum();
    write_header(&mut writer, config, vocab, vocab_table_bytes)?;

    for entry in vocab {
        writer.write_f32::<LittleEndian>(entry.score)?;
        writer.write_u32::<LittleEndian>(entry.bytes.len() as u32)?;
        writer.write_all(&entry.bytes)?;
    }

    let written = HEADER_SIZE + vocab_table_bytes;
    writer.write_all(&vec![0u8; written.next_multiple_of(WEIGHT_ALIGNMENT) - written])?;

    let mut norms = vec![&weights.rms_att, &weights.rms_ffn, &weights.rms_final];
    if config.architecture.has_qk_norm() {
        norms.extend([&weights.q_norm, &weights.k_norm]);
    }
    for norm in norms {
        norm.iter().try_for_each(|&value| writer.write_f32::<LittleEndian>(value))?;
    }

    let mut max_error = 0.0f32;
    let mut write_matrix = |values: &[f32]| -> Result<()> {
        match config.quantization {
            Quantization::F32 => values.iter().try_for_each(|&value| writer.write_f32::<LittleEndian>(value))?,
            Quantization::Q8_0 => {
                let quantized = quantize_q80(values, config.group_size)?;
                quantized.int8_data.iter().try_for_each(|&value| writer.write_i8(value))?;
                let padding = values.len().next_multiple_of(SCALE_ALIGNMENT) - values.len();
                writer.write_all(&[0u8; SCALE_ALIGNMENT][..padding])?;
                quantized.scales.iter().try_for_each(|&scale| writer.write_f32::<LittleEndian>(scale))?;
                max_error = max_error.max(quantized.max_error);
            }
        }
        Ok(())
    };

    write_matrix(weights.token_embedding.as_slice())?;
    for kind in [&weights.wq, &weights.wk, &weights.wv, &weights.wo, &weights.w1, &weights.w2, &weights.w3] {
        kind.iter().try_for_each(|layer| write_matrix(layer.as_slice()))?;
    }
    if !config.shared_classifier {
        write_matrix(weights.wcls.as_slice())?;
    }

    writer.flush()?;

    if config.quantization == Quantization::Q8_0 {
        log::debug!("quantized matrices to Q8_0 with max error {max_error:.8}");
    }
    log::info!("written model checkpoint to {}", path.display());

    Ok(())
}

fn write_header<W: Write>(
    writer: &mut W,
    config: &CheckpointConfig,
    vocab: &[VocabEntry],
    vocab_table_bytes: usize,
) -> Result<()> {
    let token_id = |id: Option<TokenId>| id.map_or(-1, |id| id as i32);
    let max_token_length = vocab.iter().map(|entry| entry.bytes.len()).max().unwrap_or_default().max(1);

    writer.write_u32::<LittleEndian>(MODEL_MAGIC)?;
    writer.write_i32::<LittleEndian>(MODEL_VERSION)?;
    writer.write_i32::<LittleEndian>(config.quantization.id())?;
    writer.write_i32::<LittleEndian>(config.architecture.id())?;

    for value in [
        config.dim,
        config.hidden_dim,
        config.n_layers,
        config.n_heads,
        config.n_kv_heads,
        vocab.len(),
        config.seq_len,
        config.head_dim,
        usize::from(config.shared_classifier),
        config.group_size,
    ] {
        writer.write_i32::<LittleEndian>(i32::try_from(value).context("header value does not fit into i32")?)?;
    }

    writer.write_i32::<LittleEndian>(token_id(config.bos_token_id))?;
    writer.write_i32::<LittleEndian>(token_id(config.eos_token_id))?;
    writer.write_i32::<LittleEndian>(max_token_length as i32)?;
    writer.write_f32::<LittleEndian>(config.rope_theta)?;
    writer.write_f32::<LittleEndian>(config.norm_eps)?;
    writer.write_u32::<LittleEndian>(u32::try_from(vocab_table_bytes).context("vocabulary table is too large")?)?;

    writer.write_all(&[0u8; HEADER_SIZE - HEADER_FIELDS_SIZE])?;

    Ok(())
}

fn validate(config: &CheckpointConfig, vocab: &[VocabEntry], weights: &DecoderWeights) -> Result<()> {
    let CheckpointConfig { dim, hidden_dim, n_layers, head_dim, .. } = *config;
    let all_heads_dim = config.all_heads_dim();
    let kv_dim = config.kv_dim();
    let vocab_size = vocab.len();

    ensure!(vocab_size > 0, "vocabulary is empty");

    let vectors = [
        ("rms_att", &weights.rms_att, n_layers * dim),
        ("rms_ffn", &weights.rms_ffn, n_layers * dim),
        ("rms_final", &weights.rms_final, dim),
        ("token_embedding", &weights.token_embedding, vocab_size * dim),
    ];
    for (name, values, expected) in vectors {
        ensure!(values.len() == expected, "{name} has {} values, expected {expected}", values.len());
    }

    if config.architecture.has_qk_norm() {
        for (name, values) in [("q_norm", &weights.q_norm), ("k_norm", &weights.k_norm)] {
            ensure!(values.len() == n_layers * head_dim, "{name} has {} values", values.len());
        }
    }

    let layered = [
        ("wq", &weights.wq, dim * all_heads_dim),
        ("wk", &weights.wk, dim * kv_dim),
        ("wv", &weights.wv, dim * kv_dim),
        ("wo", &weights.wo, all_heads_dim * dim),
        ("w1", &weights.w1, dim * hidden_dim),
        ("w2", &weights.w2, hidden_dim * dim),
        ("w3", &weights.w3, dim * hidden_dim),
    ];
    for (name, layers, expected) in layered {
        ensure!(layers.len() == n_layers, "{name} has {} layers, expected {n_layers}", layers.len());
        for (layer_idx, values) in layers.iter().enumerate() {
            ensure!(values.len() == expected, "{name}[{layer_idx}] has {} values, expected {expected}", values.len());
        }
    }

    if !config.shared_classifier {
        ensure!(weights.wcls.len() == vocab_size * dim, "wcls has {} values", weights.wcls.len());
    }

    Ok(())
}
