use super::*;

fn generate_matches(args: &[&str]) -> ArgMatches {
    let mut argv = vec!["generate", "model.bin", "-i", "hello"];
    argv.extend_from_slice(args);
    generate_subcommand().try_get_matches_from(argv).unwrap()
}

mod generation_params {
    use super::*;

    #[test]
    fn test_flags_are_mapped_to_params() {
        let matches = generate_matches(&["-t", "0", "-n", "12", "--stop", "\n", "--stop", "END", "--keep-recent"]);

        let params = generation_params(&matches).unwrap();

        assert_eq!(params.sampling.temperature, 0.0);
        assert_eq!(params.max_new_tokens, 12);
        assert_eq!(params.stop_sequences, vec!["\n".to_string(), "END".to_string()]);
        assert_eq!(params.truncation, TruncationPolicy::KeepRecent);
        assert_eq!(params.timeout, None);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let matches = generate_matches(&["--max-tokens", "0"]);

        let err = generation_params(&matches).unwrap_err();

        assert!(format!("{err:#}").contains("max_new_tokens"), "{err:#}");
    }
}
