use super::*;

fn stops(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

mod stop_matcher {
    use super::*;

    #[test]
    fn test_passes_text_through_without_stop_sequences() {
        let mut matcher = StopMatcher::new(&[]);

        assert_eq!(matcher.push("hello"), StopScan { emit: "hello".to_string(), matched: false });
        assert_eq!(matcher.flush(), "");
    }

    #[test]
    fn test_withholds_stop_sequence_split_across_pushes() {
        let mut matcher = StopMatcher::new(&stops(&["\n\n"]));

        assert_eq!(matcher.push("Hello\n"), StopScan { emit: "Hello".to_string(), matched: false });
        assert_eq!(matcher.push("\nmore"), StopScan { emit: String::new(), matched: true });
    }

    #[test]
    fn test_stops_at_earliest_match() {
        let mut matcher = StopMatcher::new(&stops(&["cd", "b"]));

        assert_eq!(matcher.push("abcd"), StopScan { emit: "a".to_string(), matched: true });
    }

    #[test]
    fn test_releases_false_alarm() {
        let mut matcher = StopMatcher::new(&stops(&["END"]));

        assert_eq!(matcher.push("xE").emit, "x");
        assert_eq!(matcher.push("Z"), StopScan { emit: "EZ".to_string(), matched: false });
    }

    #[test]
    fn test_flush_returns_withheld_prefix() {
        let mut matcher = StopMatcher::new(&stops(&["END"]));

        assert_eq!(matcher.push("xEN").emit, "x");
        assert_eq!(matcher.flush(), "EN");
        assert_eq!(matcher.flush(), "");
    }

    #[test]
    fn test_withholds_on_character_boundaries() {
        let mut matcher = StopMatcher::new(&stops(&["é!"]));

        assert_eq!(matcher.push("aé").emit, "a");
        assert_eq!(matcher.push("!"), StopScan { emit: String::new(), matched: true });
    }
}

mod batcher {
    use super::*;

    #[test]
    fn test_coalesces_tokens_into_one_increment() {
        let mut batcher = Batcher::new(2);

        assert_eq!(batcher.push("a"), None);
        assert_eq!(batcher.push("b"), Some(TextIncrement { index: 0, text: "ab".to_string() }));
        assert_eq!(batcher.push("c"), None);
        assert_eq!(batcher.take(), Some(TextIncrement { index: 1, text: "c".to_string() }));
    }

    #[test]
    fn test_empty_batches_do_not_consume_indices() {
        let mut batcher = Batcher::new(1);

        assert_eq!(batcher.push(""), None);
        assert_eq!(batcher.push("x"), Some(TextIncrement { index: 0, text: "x".to_string() }));
        assert_eq!(batcher.take(), None);
    }
}

mod params {
    use super::*;

    #[test]
    fn test_builder_defaults_match_default() {
        let params = GenerationParams::builder().build().expect("default params are valid");

        assert_eq!(params, GenerationParams::default());
    }

    #[test]
    fn test_builder_sets_fields() {
        let params = GenerationParams::builder()
            .temperature(Some(0.0))
            .top_k(Some(5))
            .max_new_tokens(Some(8))
            .stop_sequence("\n")
            .stop_sequences(["END"])
            .seed(Some(42))
            .stream_batch(Some(3))
            .truncation(Some(TruncationPolicy::KeepRecent))
            .build()
            .expect("params are valid");

        assert_eq!(params.sampling.temperature, 0.0);
        assert_eq!(params.sampling.top_k, 5);
        assert_eq!(params.max_new_tokens, 8);
        assert_eq!(params.stop_sequences, stops(&["\n", "END"]));
        assert_eq!(params.seed, Some(42));
        assert_eq!(params.stream_batch, 3);
        assert_eq!(params.truncation, TruncationPolicy::KeepRecent);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let cases = [
            GenerationParams::builder().max_new_tokens(Some(0)),
            GenerationParams::builder().stream_batch(Some(0)),
            GenerationParams::builder().stop_sequence(""),
            GenerationParams::builder().top_p(Some(1.5)),
            GenerationParams::builder().temperature(Some(-1.0)),
            GenerationParams::builder().repetition_penalty(Some(0.0)),
            GenerationParams::builder().timeout(Some(Duration::ZERO)),
        ];

        for builder in cases {
            assert!(matches!(builder.build(), Err(InferenceError::InvalidParams(_))));
        }
    }
}

mod completion {
    use super::*;

    #[test]
    fn test_reason_maps_to_terminal_phase() {
        assert_eq!(CompletionReason::MaxTokens.phase(), Phase::Completed);
        assert_eq!(CompletionReason::ContextFull.phase(), Phase::Completed);
        assert_eq!(CompletionReason::Cancelled.phase(), Phase::Cancelled);
        assert_eq!(CompletionReason::from(InferenceError::ModelNotLoaded).phase(), Phase::Failed);
        assert!(CompletionReason::Failed(InferenceError::SessionBusy).is_failure());
        assert!(!CompletionReason::EndOfSequence.is_failure());
    }

    #[test]
    fn test_tokens_per_second() {
        let stats = GenerationStats { generated_tokens: 10, decode_duration: Duration::from_secs(2), ..Default::default() };

        assert_eq!(stats.tokens_per_second(), 5.0);
        assert_eq!(GenerationStats::default().tokens_per_second(), 0.0);
    }
}
