use crate::context::XorShiftRng;
use crate::sampler::{Sampler, SamplingParams};
use crate::tokenizer::TokenId;

fn choose(logits: &[f32], params: &SamplingParams, history: &[TokenId], seed: u64) -> TokenId {
    let mut sampler = Sampler::new(logits.len());
    let mut rng = XorShiftRng::new(seed);
    sampler.choose(logits, params, history, &mut rng)
}

mod greedy {
    use super::*;

    #[test]
    fn test_picks_highest_logit() {
        assert_eq!(choose(&[0.1, 2.0, -1.0, 1.9], &SamplingParams::greedy(), &[], 1), 1);
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        assert_eq!(choose(&[1.0, 3.0, 3.0, 3.0], &SamplingParams::greedy(), &[], 1), 1);
    }

    #[test]
    fn test_does_not_consume_randomness() {
        let mut sampler = Sampler::new(3);
        let mut rng = XorShiftRng::new(9);

        sampler.choose(&[0.0, 1.0, 0.0], &SamplingParams::greedy(), &[], &mut rng);

        assert_eq!(rng, XorShiftRng::new(9));
    }
}

mod repetition_penalty {
    use super::*;

    #[test]
    fn test_penalty_moves_argmax_away_from_repeated_token() {
        let params = SamplingParams { repetition_penalty: 2.0, ..SamplingParams::greedy() };

        // 3.0 / 2 = 1.5 < 2.0
        assert_eq!(choose(&[3.0, 2.0], &params, &[0], 1), 1);
    }

    #[test]
    fn test_negative_logits_are_multiplied() {
        let params = SamplingParams { repetition_penalty: 2.0, ..SamplingParams::greedy() };

        // -1.0 * 2 = -2.0 < -1.5
        assert_eq!(choose(&[-1.0, -1.5], &params, &[0], 1), 1);
    }

    #[test]
    fn test_repeated_history_entries_are_penalized_once() {
        let params = SamplingParams { repetition_penalty: 2.0, ..SamplingParams::greedy() };

        // Penalized twice would be 1.0 and lose against 1.5.
        assert_eq!(choose(&[4.0, 1.5], &params, &[0, 0, 0], 1), 0);
    }

    #[test]
    fn test_only_recent_tokens_are_considered() {
        let params = SamplingParams { repetition_penalty: 4.0, repeat_last_n: 2, ..SamplingParams::greedy() };

        assert_eq!(choose(&[3.0, 2.0, 0.0], &params, &[0, 2, 2], 1), 0);
    }
}

mod stochastic {
    use super::*;

    #[test]
    fn test_same_seed_same_token() {
        let logits: Vec<f32> = (0..50).map(|i| ((i * 37) % 11) as f32 * 0.3).collect();
        let params = SamplingParams { temperature: 0.8, top_k: 20, top_p: 0.95, ..SamplingParams::default() };

        for seed in 1..20 {
            assert_eq!(choose(&logits, &params, &[3, 4], seed), choose(&logits, &params, &[3, 4], seed));
        }
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let params = SamplingParams { temperature: 1.5, top_k: 1, top_p: 1.0, ..SamplingParams::default() };

        for seed in 1..50 {
            assert_eq!(choose(&[0.5, 0.9, 0.9, 0.1], &params, &[], seed), 1);
        }
    }

    #[test]
    fn test_top_p_keeps_only_the_nucleus() {
        // Probabilities after softmax are roughly [0.97, 0.018, 0.018] - token 0 alone reaches 0.5.
        let params = SamplingParams { temperature: 1.0, top_p: 0.5, ..SamplingParams::default() };

        for seed in 1..50 {
            assert_eq!(choose(&[5.0, 1.0, 1.0], &params, &[], seed), 0);
        }
    }

    #[test]
    fn test_samples_cover_the_distribution() {
        let params = SamplingParams { temperature: 1.0, top_p: 1.0, ..SamplingParams::default() };
        let mut sampler = Sampler::new(2);
        let mut rng = XorShiftRng::new(123);

        let ones = (0..1000).filter(|_| sampler.choose(&[0.0, 0.0], &params, &[], &mut rng) == 1).count();

        assert!((350..650).contains(&ones), "{ones}");
    }
}

mod params {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(SamplingParams::default().validate().is_ok());
        assert!(SamplingParams { temperature: -1.0, ..SamplingParams::default() }.validate().is_err());
        assert!(SamplingParams { top_p: 1.5, ..SamplingParams::default() }.validate().is_err());
        assert!(SamplingParams { repetition_penalty: 0.0, ..SamplingParams::default() }.validate().is_err());
    }
}
