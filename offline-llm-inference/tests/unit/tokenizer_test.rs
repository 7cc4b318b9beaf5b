use crate::error::TokenizationError;
use crate::tokenizer::{StreamDecoder, TokenId, Tokenizer};

/// Builds a tokenizer from `(token, score)` pairs.
fn tokenizer_from(entries: &[(&[u8], f32)], eos: Option<TokenId>) -> Tokenizer {
    let vocab = entries.iter().map(|(bytes, _)| bytes.to_vec()).collect();
    let scores = entries.iter().map(|(_, score)| *score).collect();
    Tokenizer::new(vocab, scores, None, eos)
}

fn byte_level_tokenizer() -> Tokenizer {
    let mut entries: Vec<(Vec<u8>, f32)> = (0u8..=255).map(|byte| (vec![byte], 0.0)).collect();
    entries.push((b"he".to_vec(), 1.0));
    entries.push((b"ll".to_vec(), 2.0));
    entries.push((b"hell".to_vec(), 3.0));
    entries.push((b"<|end|>".to_vec(), 0.0));
    let vocab = entries.iter().map(|(bytes, _)| bytes.clone()).collect();
    let scores = entries.iter().map(|(_, score)| *score).collect();
    Tokenizer::new(vocab, scores, None, Some(259))
}

mod encode {
    use super::*;

    #[test]
    fn test_merges_by_highest_score() {
        let tokenizer = byte_level_tokenizer();

        let tokens = tokenizer.encode("hello").unwrap();

        let hell = tokenizer.token_id("hell").unwrap();
        assert_eq!(tokens, vec![hell, b'o' as TokenId]);
    }

    #[test]
    fn test_ties_merge_leftmost_pair_first() {
        let tokenizer = tokenizer_from(&[(b"a", 0.0), (b"aa", 1.0)], None);

        let tokens = tokenizer.encode("aaa").unwrap();

        assert_eq!(tokens, vec![1, 0]);
    }

    #[test]
    fn test_special_token_is_matched_as_a_whole() {
        let tokenizer = byte_level_tokenizer();

        let tokens = tokenizer.encode("o<|end|>o").unwrap();

        assert_eq!(tokens, vec![b'o' as TokenId, 259, b'o' as TokenId]);
    }

    #[test]
    fn test_unknown_angle_span_falls_back_to_characters() {
        let tokenizer = byte_level_tokenizer();

        let tokens = tokenizer.encode("<x>").unwrap();

        assert_eq!(tokens, vec![b'<' as TokenId, b'x' as TokenId, b'>' as TokenId]);
    }

    #[test]
    fn test_character_without_token_uses_byte_fallback() {
        let tokenizer = byte_level_tokenizer();

        let tokens = tokenizer.encode("é").unwrap();

        assert_eq!(tokens, vec![0xC3, 0xA9]);
    }

    #[test]
    fn test_uncovered_character_is_an_error() {
        let tokenizer = tokenizer_from(&[(b"a", 0.0), (b"b", 0.0)], None);

        let result = tokenizer.encode("ab€");

        assert_eq!(result, Err(TokenizationError::UnknownCharacter { ch: '€', offset: 2 }));
    }

    #[test]
    fn test_empty_text_encodes_to_nothing() {
        let tokenizer = byte_level_tokenizer();

        assert_eq!(tokenizer.encode("").unwrap(), Vec::<TokenId>::new());
    }
}

mod decode {
    use super::*;

    #[test]
    fn test_round_trip_for_covered_text() {
        let tokenizer = byte_level_tokenizer();

        for text in ["hello world", "héllo 👋", "<|end|> tail", ""] {
            let tokens = tokenizer.encode(text).unwrap();
            assert_eq!(tokenizer.decode(&tokens).unwrap(), text);
        }
    }

    #[test]
    fn test_invalid_token_id() {
        let tokenizer = byte_level_tokenizer();

        assert_eq!(tokenizer.decode(&[10_000]), Err(TokenizationError::InvalidToken(10_000)));
        assert_eq!(tokenizer.token_bytes(10_000), Err(TokenizationError::InvalidToken(10_000)));
    }

    #[test]
    fn test_invalid_utf8_reports_offending_bytes() {
        let tokenizer = byte_level_tokenizer();

        let result = tokenizer.decode(&[b'a' as TokenId, 0xFF, b'b' as TokenId]);

        assert_eq!(result, Err(TokenizationError::InvalidUtf8 { bytes: vec![0xFF] }));
    }

    #[test]
    fn test_end_of_generation() {
        let tokenizer = byte_level_tokenizer();

        assert!(tokenizer.is_end_of_generation(259));
        assert!(!tokenizer.is_end_of_generation(b'a' as TokenId));
    }
}

mod stream_decoder {
    use super::*;

    #[test]
    fn test_multibyte_character_is_released_once_complete() {
        let emoji = "👋".as_bytes();
        let mut decoder = StreamDecoder::new();

        assert_eq!(decoder.push(&emoji[..1]).unwrap(), None);
        assert_eq!(decoder.push(&emoji[1..3]).unwrap(), None);
        assert!(decoder.has_pending());
        assert_eq!(decoder.push(&emoji[3..]).unwrap().as_deref(), Some("👋"));
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_complete_prefix_is_released_before_partial_tail() {
        let mut decoder = StreamDecoder::new();
        let mut bytes = b"ok ".to_vec();
        bytes.extend_from_slice(&"é".as_bytes()[..1]);

        assert_eq!(decoder.push(&bytes).unwrap().as_deref(), Some("ok "));
        assert_eq!(decoder.push(&"é".as_bytes()[1..]).unwrap().as_deref(), Some("é"));
    }

    #[test]
    fn test_impossible_sequence_is_an_error() {
        let mut decoder = StreamDecoder::new();

        assert_eq!(decoder.push(&[0xE2, 0x28]), Err(TokenizationError::InvalidUtf8 { bytes: vec![0xE2] }));
    }

    #[test]
    fn test_finish_returns_unfinished_bytes() {
        let mut decoder = StreamDecoder::new();
        decoder.push(&[0xF0, 0x9F]).unwrap();

        assert_eq!(decoder.finish(), vec![0xF0, 0x9F]);
        assert!(!decoder.has_pending());
    }
}
