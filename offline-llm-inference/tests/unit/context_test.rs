use crate::context::XorShiftRng;

#[test]
fn test_same_seed_same_sequence() {
    let mut first = XorShiftRng::new(42);
    let mut second = XorShiftRng::new(42);

    let a: Vec<u32> = (0..16).map(|_| first.next_u32()).collect();
    let b: Vec<u32> = (0..16).map(|_| second.next_u32()).collect();

    assert_eq!(a, b);
}

#[test]
fn test_different_seeds_diverge() {
    let mut first = XorShiftRng::new(1);
    let mut second = XorShiftRng::new(2);

    let a: Vec<u32> = (0..4).map(|_| first.next_u32()).collect();
    let b: Vec<u32> = (0..4).map(|_| second.next_u32()).collect();

    assert_ne!(a, b);
}

#[test]
fn test_zero_seed_still_produces_values() {
    let mut rng = XorShiftRng::new(0);

    let values: Vec<u32> = (0..4).map(|_| rng.next_u32()).collect();

    assert!(values.iter().any(|&value| value != 0));
}

#[test]
fn test_floats_are_in_unit_interval() {
    let mut rng = XorShiftRng::new(7);

    for _ in 0..1000 {
        let value = rng.next_f32();
        assert!((0.0..1.0).contains(&value), "{value}");
    }
}
