#[cfg(test)]
#[path = "../tests/unit/configuration_test.rs"]
mod tests;

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;

use crate::error::ModelLoadError;
use crate::tokenizer::TokenId;
use crate::utils::MemoryMapper;

/// Magic number for validating model files ("OLLM").
pub const MODEL_MAGIC: u32 = 0x4D4C_4C4F;
/// Expected model file version.
pub const MODEL_VERSION: i32 = 1;
/// Size of the model file header in bytes.
pub const HEADER_SIZE: usize = 256;
/// Size of the populated part of the header.
pub(crate) const HEADER_FIELDS_SIZE: usize = 80;
/// Alignment of the weight section.
pub const WEIGHT_ALIGNMENT: usize = 64;
/// Alignment of the scales that follow each int8 block of a Q8_0 matrix.
pub const SCALE_ALIGNMENT: usize = 4;
/// Threads used by a model when the caller does not specify a count.
pub const DEFAULT_THREAD_COUNT: usize = 4;

/// Storage scheme of the weight matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Quantization {
    /// Full precision matrices.
    F32,
    /// Symmetric int8 with one f32 scale per group of `group_size` values.
    Q8_0,
}

impl Quantization {
    pub(crate) fn id(self) -> i32 {
        match self {
            Quantization::F32 => 0,
            Quantization::Q8_0 => 1,
        }
    }

    pub(crate) fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Quantization::F32),
            1 => Some(Quantization::Q8_0),
            _ => None,
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantization::F32 => write!(f, "F32"),
            Quantization::Q8_0 => write!(f, "Q8_0"),
        }
    }
}

/// Quantization the caller expects the model file to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantizationHint {
    /// Accept whatever the file declares.
    #[default]
    Any,
    /// Require the given scheme and reject other files.
    Exact(Quantization),
}

impl QuantizationHint {
    pub fn accepts(self, quantization: Quantization) -> bool {
        match self {
            QuantizationHint::Any => true,
            QuantizationHint::Exact(expected) => expected == quantization,
        }
    }
}

impl fmt::Display for QuantizationHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantizationHint::Any => write!(f, "any"),
            QuantizationHint::Exact(quantization) => write!(f, "{quantization}"),
        }
    }
}

/// Layer layout of the network stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Architecture {
    /// Decoder-only transformer with RMSNorm applied to query and key heads.
    QkNormDecoder,
    /// Decoder-only transformer without query/key normalization.
    Decoder,
}

impl Architecture {
    pub(crate) fn id(self) -> i32 {
        match self {
            Architecture::QkNormDecoder => 1,
            Architecture::Decoder => 2,
        }
    }

    fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Architecture::QkNormDecoder),
            2 => Some(Architecture::Decoder),
            _ => None,
        }
    }

    pub fn has_qk_norm(self) -> bool {
        matches!(self, Architecture::QkNormDecoder)
    }
}

/// Model hyperparameters as declared by the file header.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub quantization: Quantization,
    pub architecture: Architecture,
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    /// Maximum context the model was built for.
    pub seq_len: usize,
    pub vocab_size: usize,
    pub group_size: usize,
    pub shared_classifier: bool,
    pub bos_token_id: Option<TokenId>,
    pub eos_token_id: Option<TokenId>,
    pub max_token_length: usize,
    pub rope_theta: f32,
    pub norm_eps: f32,
    pub vocab_table_bytes: usize,
}

impl ModelConfig {
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    pub fn all_heads_dim(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Offset of the weight section from the start of the file.
    pub fn weights_offset(&self) -> usize {
        (HEADER_SIZE + self.vocab_table_bytes).next_multiple_of(WEIGHT_ALIGNMENT)
    }

    /// Bytes occupied by one matrix of `elements` values.
    fn matrix_bytes(&self, elements: u128) -> u128 {
        match self.quantization {
            Quantization::F32 => elements * 4,
            Quantization::Q8_0 => {
                elements.next_multiple_of(SCALE_ALIGNMENT as u128) + (elements / self.group_size as u128) * 4
            }
        }
    }

    /// Size of the whole file implied by the header, saturated to `u64`.
    pub fn expected_file_size(&self) -> u64 {
        let [dim, hidden_dim, head_dim, layers, vocab_size] =
            [self.dim, self.hidden_dim, self.head_dim, self.n_layers, self.vocab_size].map(|v| v as u128);
        let all_heads_dim = self.all_heads_dim() as u128;
        let kv_dim = self.kv_dim() as u128;

        let qk_norms = if self.architecture.has_qk_norm() { 2 * layers * head_dim } else { 0 };
        let norms = (2 * layers * dim + dim + qk_norms) * 4;

        let per_layer = self.matrix_bytes(dim * all_heads_dim)
            + 2 * self.matrix_bytes(dim * kv_dim)
            + self.matrix_bytes(all_heads_dim * dim)
            + 3 * self.matrix_bytes(dim * hidden_dim);
        let embedding = self.matrix_bytes(vocab_size * dim);
        let classifier = if self.shared_classifier { 0 } else { embedding };

        let total = self.weights_offset() as u128 + norms + embedding + layers * per_layer + classifier;
        u64::try_from(total).unwrap_or(u64::MAX)
    }
}

/// Header fields exactly as stored on disk.
#[derive(Debug, Clone, Copy)]
struct RawHeader {
    magic_number: u32,
    version: i32,
    quantization: i32,
    architecture: i32,
    dim: i32,
    hidden_dim: i32,
    n_layers: i32,
    n_heads: i32,
    n_kv_heads: i32,
    vocab_size: i32,
    seq_len: i32,
    head_dim: i32,
    shared_classifier: i32,
    group_size: i32,
    bos_token_id: i32,
    eos_token_id: i32,
    max_token_length: i32,
    rope_theta: f32,
    norm_eps: f32,
    vocab_table_bytes: u32,
}

/// Reads and validates the header, leaving the mapper at the vocabulary table.
///
/// The header is 256 bytes; the populated part is 20 little-endian fields
/// followed by zero padding.
pub(crate) fn read_header(mapper: &mut MemoryMapper) -> Result<ModelConfig, ModelLoadError> {
    if mapper.len() < HEADER_SIZE {
        return Err(ModelLoadError::Truncated {
            path: mapper.path().to_path_buf(),
            expected: HEADER_SIZE as u64,
            actual: mapper.len() as u64,
        });
    }

    let raw = {
        let data = mapper.get_bytes(HEADER_FIELDS_SIZE)?;
        let mut cursor = Cursor::new(data);

        // The slice length was checked above, reads cannot fail.
        macro_rules! read_i32 {
            () => {
                cursor.read_i32::<LittleEndian>().unwrap_or_default()
            };
        }

        RawHeader {
            magic_number: cursor.read_u32::<LittleEndian>().unwrap_or_default(),
            version: read_i32!(),
            quantization: read_i32!(),
            architecture: read_i32!(),
            dim: read_i32!(),
            hidden_dim: read_i32!(),
            n_layers: read_i32!(),
            n_heads: read_i32!(),
            n_kv_heads: read_i32!(),
            vocab_size: read_i32!(),
            seq_len: read_i32!(),
            head_dim: read_i32!(),
            shared_classifier: read_i32!(),
            group_size: read_i32!(),
            bos_token_id: read_i32!(),
            eos_token_id: read_i32!(),
            max_token_length: read_i32!(),
            rope_theta: cursor.read_f32::<LittleEndian>().unwrap_or_default(),
            norm_eps: cursor.read_f32::<LittleEndian>().unwrap_or_default(),
            vocab_table_bytes: cursor.read_u32::<LittleEndian>().unwrap_or_default(),
        }
    };

    mapper.skip(HEADER_SIZE - HEADER_FIELDS_SIZE)?;

    let config = validate_header(&raw, mapper)?;

    let expected = config.expected_file_size();
    let actual = mapper.len() as u64;
    if actual < expected {
        return Err(ModelLoadError::Truncated { path: mapper.path().to_path_buf(), expected, actual });
    }
    if actual > expected {
        log::warn!("{} has {} trailing bytes after the weights", mapper.path().display(), actual - expected);
    }

    Ok(config)
}

/// Validates the raw header to ensure it describes a supported model.
fn validate_header(raw: &RawHeader, mapper: &MemoryMapper) -> Result<ModelConfig, ModelLoadError> {
    let path = mapper.path().to_path_buf();

    if raw.magic_number != MODEL_MAGIC {
        return Err(ModelLoadError::BadMagic { path, expected: MODEL_MAGIC, actual: raw.magic_number });
    }

    if raw.version != MODEL_VERSION {
        return Err(ModelLoadError::VersionMismatch { path, expected: MODEL_VERSION, actual: raw.version });
    }

    let invalid = |reason: String| ModelLoadError::InvalidHeader { path: path.clone(), reason };

    let quantization =
        Quantization::from_id(raw.quantization).ok_or_else(|| invalid(format!("unknown quantization {}", raw.quantization)))?;
    let architecture =
        Architecture::from_id(raw.architecture).ok_or_else(|| invalid(format!("unknown architecture {}", raw.architecture)))?;

    let dimensions = [
        ("dim", raw.dim),
        ("hidden_dim", raw.hidden_dim),
        ("n_layers", raw.n_layers),
        ("n_heads", raw.n_heads),
        ("n_kv_heads", raw.n_kv_heads),
        ("vocab_size", raw.vocab_size),
        ("seq_len", raw.seq_len),
        ("head_dim", raw.head_dim),
        ("max_token_length", raw.max_token_length),
    ];

    for (name, value) in dimensions {
        if value <= 0 {
            return Err(invalid(format!("{name} must be positive, got {value}")));
        }
    }

    if raw.n_heads % raw.n_kv_heads != 0 {
        return Err(invalid(format!("n_heads {} is not a multiple of n_kv_heads {}", raw.n_heads, raw.n_kv_heads)));
    }

    if raw.head_dim % 2 != 0 {
        return Err(invalid(format!("head_dim must be even for rotary embeddings, got {}", raw.head_dim)));
    }

    let all_heads_dim = raw
        .n_heads
        .checked_mul(raw.head_dim)
        .ok_or_else(|| invalid(format!("n_heads {} * head_dim {} overflows", raw.n_heads, raw.head_dim)))?;

    // Execution contexts hold keys and values of every layer for up to `seq_len`
    // positions plus `n_heads * seq_len` attention scores; both must be addressable.
    let context_bytes = |factors: &[i32]| {
        factors
            .iter()
            .try_fold(2 * std::mem::size_of::<f32>(), |acc, &factor| acc.checked_mul(factor as usize))
            .filter(|&bytes| bytes <= isize::MAX as usize)
    };
    if context_bytes(&[raw.n_layers, raw.seq_len, raw.n_kv_heads, raw.head_dim]).is_none()
        || context_bytes(&[raw.n_heads, raw.seq_len]).is_none()
    {
        return Err(invalid(format!(
            "execution context for seq_len {} with {} layers and {} heads overflows the address space",
            raw.seq_len, raw.n_layers, raw.n_heads
        )));
    }

    if quantization == Quantization::Q8_0 {
        if raw.group_size <= 0 {
            return Err(invalid(format!("group_size must be positive, got {}", raw.group_size)));
        }
        for (name, value) in [("dim", raw.dim), ("hidden_dim", raw.hidden_dim), ("n_heads * head_dim", all_heads_dim)] {
            if value % raw.group_size != 0 {
                return Err(invalid(format!("{name} {value} is not divisible by group_size {}", raw.group_size)));
            }
        }
    }

    let token_id = |name: &str, value: i32| match value {
        -1 => Ok(None),
        id if (0..raw.vocab_size).contains(&id) => Ok(Some(id as TokenId)),
        id => Err(invalid(format!("{name} {id} is outside of the vocabulary"))),
    };
    let bos_token_id = token_id("bos_token_id", raw.bos_token_id)?;
    let eos_token_id = token_id("eos_token_id", raw.eos_token_id)?;

    for (name, value) in [("rope_theta", raw.rope_theta), ("norm_eps", raw.norm_eps)] {
        if !(value.is_finite() && value > 0.0) {
            return Err(invalid(format!("{name} must be a positive number, got {value}")));
        }
    }

    Ok(ModelConfig {
        quantization,
        architecture,
        dim: raw.dim as usize,
        hidden_dim: raw.hidden_dim as usize,
        n_layers: raw.n_layers as usize,
        n_heads: raw.n_heads as usize,
        n_kv_heads: raw.n_kv_heads as usize,
        head_dim: raw.head_dim as usize,
        seq_len: raw.seq_len as usize,
        vocab_size: raw.vocab_size as usize,
        group_size: raw.group_size.max(0) as usize,
        shared_classifier: raw.shared_classifier != 0,
        bos_token_id,
        eos_token_id,
        max_token_length: raw.max_token_length as usize,
        rope_theta: raw.rope_theta,
        norm_eps: raw.norm_eps,
        vocab_table_bytes: raw.vocab_table_bytes as usize,
    })
}

/// Options for loading a model.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    /// Number of positions each session can hold; `None` uses the model's `seq_len`.
    pub context_window: Option<usize>,
    /// Threads of the model's inference pool.
    pub thread_count: usize,
    pub quantization_hint: QuantizationHint,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self { context_window: None, thread_count: DEFAULT_THREAD_COUNT, quantization_hint: QuantizationHint::Any }
    }
}

impl LoadConfig {
    pub fn builder() -> LoadConfigBuilder {
        LoadConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct LoadConfigBuilder {
    context_window: Option<usize>,
    thread_count: Option<usize>,
    quantization_hint: Option<QuantizationHint>,
}

impl LoadConfigBuilder {
    /// Zero is treated as "not set".
    pub fn context_window(mut self, context_window: Option<usize>) -> Self {
        self.context_window = context_window.filter(|&value| value > 0);
        self
    }
    /// Zero is treated as "not set".
    pub fn thread_count(mut self, thread_count: Option<usize>) -> Self {
        self.thread_count = thread_count.filter(|&value| value > 0);
        self
    }
    pub fn quantization_hint(mut self, hint: Option<QuantizationHint>) -> Self {
        self.quantization_hint = hint;
        self
    }
    pub fn build(self) -> LoadConfig {
        LoadConfig {
            context_window: self.context_window,
            thread_count: self.thread_count.unwrap_or(DEFAULT_THREAD_COUNT),
            quantization_hint: self.quantization_hint.unwrap_or_default(),
        }
    }
}
