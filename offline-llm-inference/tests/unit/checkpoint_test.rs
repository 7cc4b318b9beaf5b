use super::*;
use crate::configuration::read_header;
use crate::utils::MemoryMapper;

fn create_test_config(quantization: Quantization) -> CheckpointConfig {
    CheckpointConfig {
        quantization,
        architecture: Architecture::QkNormDecoder,
        dim: 8,
        hidden_dim: 16,
        n_layers: 2,
        n_heads: 2,
        n_kv_heads: 1,
        head_dim: 4,
        seq_len: 32,
        group_size: 4,
        shared_classifier: false,
        bos_token_id: None,
        eos_token_id: Some(2),
        rope_theta: 10000.0,
        norm_eps: 1e-5,
    }
}

fn create_test_vocab() -> Vec<VocabEntry> {
    vec![VocabEntry::new("a", 0.0), VocabEntry::new("bc", 1.0), VocabEntry::new("</s>", 0.0)]
}

mod quantize {
    use super::*;

    #[test]
    fn test_quantize_q80_known_values() {
        let weights = vec![0.0, 127.0, -127.0, 63.5];

        let result = quantize_q80(&weights, 4).unwrap();

        assert_eq!(result.scales, vec![1.0]);
        // 63.5 rounds half to even
        assert_eq!(result.int8_data, vec![0, 127, -127, 64]);
        assert!((result.max_error - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_quantize_q80_zero_weights() {
        let result = quantize_q80(&[0.0; 4], 4).unwrap();

        assert_eq!(result.scales, vec![1.0]);
        assert!(result.int8_data.iter().all(|&x| x == 0));
        assert_eq!(result.max_error, 0.0);
    }

    #[test]
    fn test_quantize_q80_rejects_partial_group() {
        assert!(quantize_q80(&[1.0; 6], 4).is_err());
    }
}

mod write {
    use super::*;

    #[test]
    fn test_written_file_matches_header_size() {
        for quantization in [Quantization::Q8_0, Quantization::F32] {
            let config = create_test_config(quantization);
            let vocab = create_test_vocab();
            let weights = DecoderWeights::seeded(&config, vocab.len(), 3, 1.0);
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("model.bin");

            write_checkpoint(&path, &config, &vocab, &weights).unwrap();

            let mut mapper = MemoryMapper::open(&path).unwrap();
            let header = read_header(&mut mapper).unwrap();
            assert_eq!(header.quantization, quantization);
            assert_eq!(header.vocab_size, 3);
            assert_eq!(header.max_token_length, 4);
            assert_eq!(header.eos_token_id, Some(2));
            assert_eq!(header.vocab_table_bytes, 3 * 8 + 1 + 2 + 4);
            assert_eq!(header.expected_file_size(), std::fs::metadata(&path).unwrap().len());
        }
    }

    #[test]
    fn test_int8_blocks_are_padded_before_scales() {
        let config = CheckpointConfig {
            dim: 2,
            hidden_dim: 2,
            n_layers: 1,
            n_heads: 1,
            head_dim: 2,
            group_size: 2,
            ..create_test_config(Quantization::Q8_0)
        };
        let vocab = create_test_vocab();
        let weights = DecoderWeights::seeded(&config, vocab.len(), 1, 1.0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");

        write_checkpoint(&path, &config, &vocab, &weights).unwrap();

        let mut mapper = MemoryMapper::open(&path).unwrap();
        let header = read_header(&mut mapper).unwrap();
        // norms: rms_att, rms_ffn, rms_final, q_norm, k_norm of 2 values each = 40 bytes
        // each matrix: i8 block padded to 4 plus one scale per 2 values
        // embedding 6 -> 8 + 12, wq/wk/wv/wo 4 -> 4 + 8, w1/w2/w3 4 -> 4 + 8, wcls 6 -> 8 + 12
        let expected = header.weights_offset() as u64 + 40 + 20 + 7 * 12 + 20;
        assert_eq!(header.expected_file_size(), expected);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    }

    #[test]
    fn test_rejects_mismatched_shapes() {
        let config = create_test_config(Quantization::Q8_0);
        let vocab = create_test_vocab();
        let mut weights = DecoderWeights::zeros(&config, vocab.len());
        weights.wq.pop();
        let dir = tempfile::tempdir().unwrap();

        let err = write_checkpoint(&dir.path().join("model.bin"), &config, &vocab, &weights).unwrap_err();

        assert!(err.to_string().contains("wq"), "{err}");
    }

    #[test]
    fn test_seeded_weights_are_reproducible() {
        let config = create_test_config(Quantization::F32);

        let first = DecoderWeights::seeded(&config, 3, 5, 0.5);
        let second = DecoderWeights::seeded(&config, 3, 5, 0.5);

        assert_eq!(first.wq, second.wq);
        assert_eq!(first.wcls, second.wcls);
        assert!(first.w1.iter().flatten().all(|value| (-0.5..0.5).contains(value)));
    }
}
