use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::configuration::*;
use crate::error::ModelLoadError;
use crate::utils::MemoryMapper;

/// Header fields in on-disk order, starting after the magic number.
struct HeaderFields {
    magic: u32,
    version: i32,
    quantization: i32,
    architecture: i32,
    dims: [i32; 13],
    rope_theta: f32,
    norm_eps: f32,
    vocab_table_bytes: u32,
}

impl Default for HeaderFields {
    fn default() -> Self {
        Self {
            magic: MODEL_MAGIC,
            version: MODEL_VERSION,
            quantization: 1,
            architecture: 2,
            // dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, seq_len, head_dim,
            // shared_classifier, group_size, bos, eos, max_token_length
            dims: [8, 16, 1, 2, 1, 4, 32, 4, 1, 4, -1, 3, 4],
            rope_theta: 10000.0,
            norm_eps: 1e-5,
            vocab_table_bytes: 0,
        }
    }
}

fn header_bytes(fields: &HeaderFields) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE);
    bytes.write_u32::<LittleEndian>(fields.magic).unwrap();
    bytes.write_i32::<LittleEndian>(fields.version).unwrap();
    bytes.write_i32::<LittleEndian>(fields.quantization).unwrap();
    bytes.write_i32::<LittleEndian>(fields.architecture).unwrap();
    for value in fields.dims {
        bytes.write_i32::<LittleEndian>(value).unwrap();
    }
    bytes.write_f32::<LittleEndian>(fields.rope_theta).unwrap();
    bytes.write_f32::<LittleEndian>(fields.norm_eps).unwrap();
    bytes.write_u32::<LittleEndian>(fields.vocab_table_bytes).unwrap();
    assert_eq!(bytes.len(), HEADER_FIELDS_SIZE);
    bytes.resize(HEADER_SIZE, 0);
    bytes
}

fn write_file(dir: &Path, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join("model.bin");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    path
}

fn read(bytes: &[u8]) -> Result<ModelConfig, ModelLoadError> {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), bytes);
    let mut mapper = MemoryMapper::open(&path).unwrap();
    read_header(&mut mapper)
}

/// Header followed by as many zero bytes as the header implies.
fn complete_file(fields: &HeaderFields) -> Vec<u8> {
    let header = header_bytes(fields);
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), &header);
    let mut mapper = MemoryMapper::open(&path).unwrap();

    let expected = match read_header(&mut mapper) {
        Err(ModelLoadError::Truncated { expected, .. }) => expected as usize,
        other => panic!("expected a truncated error, got {other:?}"),
    };

    let mut bytes = header;
    bytes.resize(expected, 0);
    bytes
}

mod header {
    use super::*;

    #[test]
    fn test_valid_header_is_parsed() {
        let config = read(&complete_file(&HeaderFields::default())).unwrap();

        assert_eq!(config.quantization, Quantization::Q8_0);
        assert_eq!(config.architecture, Architecture::Decoder);
        assert_eq!(config.dim, 8);
        assert_eq!(config.n_heads, 2);
        assert_eq!(config.kv_dim(), 4);
        assert_eq!(config.all_heads_dim(), 8);
        assert_eq!(config.bos_token_id, None);
        assert_eq!(config.eos_token_id, Some(3));
        assert!(config.shared_classifier);
        assert_eq!(config.weights_offset(), 256);
    }

    #[test]
    fn test_expected_file_size_counts_every_block() {
        let config = read(&complete_file(&HeaderFields::default())).unwrap();

        // norms: (2 * 1 * 8 + 8) * 4 = 96
        // q8 matrix of n values: n + n / 4 * 4 = 2n
        // embedding 4 * 8 -> 64, wq 64 -> 128, wk/wv 32 -> 64 each, wo 128, w1/w2/w3 128 -> 256 each
        let expected = 256 + 96 + 64 + 128 + 2 * 64 + 128 + 3 * 256;
        assert_eq!(config.expected_file_size(), expected);
    }

    #[test]
    fn test_short_file_is_truncated() {
        let result = read(&[0u8; 100]);

        assert!(matches!(result, Err(ModelLoadError::Truncated { expected: 256, actual: 100, .. })));
    }

    #[test]
    fn test_bad_magic() {
        let fields = HeaderFields { magic: 0xDEAD_BEEF, ..HeaderFields::default() };

        let result = read(&header_bytes(&fields));

        assert!(matches!(
            result,
            Err(ModelLoadError::BadMagic { expected: MODEL_MAGIC, actual: 0xDEAD_BEEF, .. })
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let fields = HeaderFields { version: 7, ..HeaderFields::default() };

        let result = read(&header_bytes(&fields));

        assert!(matches!(result, Err(ModelLoadError::VersionMismatch { expected: 1, actual: 7, .. })));
    }

    #[test]
    fn test_missing_weights_are_truncated() {
        let result = read(&header_bytes(&HeaderFields::default()));

        assert!(matches!(result, Err(ModelLoadError::Truncated { actual: 256, .. })));
    }

    #[test]
    fn test_invalid_headers() {
        let mut cases = Vec::new();

        let mut fields = HeaderFields::default();
        fields.dims[0] = 0;
        cases.push(("non-positive dim", fields));

        let mut fields = HeaderFields::default();
        fields.dims[3] = 3;
        fields.dims[4] = 2;
        cases.push(("heads not divisible", fields));

        let mut fields = HeaderFields::default();
        fields.dims[7] = 3;
        cases.push(("odd head_dim", fields));

        let mut fields = HeaderFields::default();
        fields.dims[9] = 3;
        cases.push(("group size", fields));

        cases.push(("quantization", HeaderFields { quantization: 9, ..HeaderFields::default() }));
        cases.push(("architecture", HeaderFields { architecture: 0, ..HeaderFields::default() }));
        cases.push(("rope theta", HeaderFields { rope_theta: f32::NAN, ..HeaderFields::default() }));

        let mut fields = HeaderFields::default();
        fields.dims[11] = 4;
        cases.push(("eos outside vocabulary", fields));

        for (name, fields) in cases {
            let result = read(&header_bytes(&fields));
            assert!(matches!(result, Err(ModelLoadError::InvalidHeader { .. })), "{name}: {result:?}");
        }
    }

    #[test]
    fn test_overflowing_dimensions_are_invalid() {
        let mut heads = HeaderFields::default();
        heads.dims[3] = 65536;
        heads.dims[7] = 65536;

        let mut context = HeaderFields::default();
        context.dims[2] = i32::MAX;
        context.dims[6] = i32::MAX;

        for (name, fields) in [("n_heads * head_dim", heads), ("context", context)] {
            let result = read(&header_bytes(&fields));
            assert!(matches!(result, Err(ModelLoadError::InvalidHeader { .. })), "{name}: {result:?}");
        }
    }

    #[test]
    fn test_group_size_is_ignored_for_f32() {
        let mut fields = HeaderFields { quantization: 0, ..HeaderFields::default() };
        fields.dims[9] = 0;

        let config = read(&complete_file(&fields)).unwrap();

        assert_eq!(config.quantization, Quantization::F32);
        assert_eq!(config.group_size, 0);
    }
}

mod load_config {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoadConfig::builder().build();

        assert_eq!(config.context_window, None);
        assert_eq!(config.thread_count, DEFAULT_THREAD_COUNT);
        assert_eq!(config.quantization_hint, QuantizationHint::Any);
    }

    #[test]
    fn test_zero_values_mean_default() {
        let config = LoadConfig::builder().context_window(Some(0)).thread_count(Some(0)).build();

        assert_eq!(config.context_window, None);
        assert_eq!(config.thread_count, DEFAULT_THREAD_COUNT);
    }

    #[test]
    fn test_quantization_hint() {
        assert!(QuantizationHint::Any.accepts(Quantization::F32));
        assert!(QuantizationHint::Exact(Quantization::Q8_0).accepts(Quantization::Q8_0));
        assert!(!QuantizationHint::Exact(Quantization::Q8_0).accepts(Quantization::F32));
    }
}
