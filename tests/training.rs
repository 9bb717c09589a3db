//! Training scenarios: the object layer and the compiled VM must both learn,
//! and must agree with each other

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rnnforge::{compile, math, Network};

const TRAINING_RATE: f64 = 0.25;

/// Four XOR presentations, one epoch
fn train_xor_epoch(mut step: impl FnMut(&[f64], f64)) {
    step(&[0.0, 1.0], 1.0);
    step(&[0.0, 0.0], 0.0);
    step(&[1.0, 0.0], 1.0);
    step(&[1.0, 1.0], 0.0);
}

#[test]
fn xor_trained_on_the_object_layer() {
    let mut rng = StdRng::seed_from_u64(0x0e55);
    let mut network = Network::feed_forward_with_rng(&mut rng, 2, &[20], 1).unwrap();

    for _ in 0..2500 {
        train_xor_epoch(|inputs, target| {
            network.feed(inputs).unwrap();
            network.train(TRAINING_RATE, &[target]).unwrap();
        });
    }

    assert!(network.feed(&[0.0, 1.0]).unwrap()[0] > 0.9);
    assert!(network.feed(&[1.0, 0.0]).unwrap()[0] > 0.9);
    assert!(network.feed(&[0.0, 0.0]).unwrap()[0] < 0.1);
    assert!(network.feed(&[1.0, 1.0]).unwrap()[0] < 0.1);
}

#[test]
fn xor_trained_on_the_compiled_vm() {
    let mut rng = StdRng::seed_from_u64(0x0e55);
    let network = Network::feed_forward_with_rng(&mut rng, 2, &[20], 1).unwrap();
    let mut vm = compile(&network).unwrap();

    for _ in 0..2500 {
        train_xor_epoch(|inputs, target| {
            vm.feed(inputs).unwrap();
            vm.train(TRAINING_RATE, &[target]).unwrap();
        });
    }

    assert!(vm.feed(&[0.0, 1.0]).unwrap()[0] > 0.9);
    assert!(vm.feed(&[1.0, 0.0]).unwrap()[0] > 0.9);
    assert!(vm.feed(&[0.0, 0.0]).unwrap()[0] < 0.1);
    assert!(vm.feed(&[1.0, 1.0]).unwrap()[0] < 0.1);
}

/// A random-ish periodic function with a small amplitude seed, so the target
/// mostly stays inside the sigmoid's output range
fn periodic(x: f64) -> f64 {
    const SEED: f64 = 0.1;
    SEED * 2.0 + x.cos() * SEED * 3.0 + x.tanh() * x.sin() * x.sin() * SEED * -0.5
}

#[test]
fn deep_network_models_a_periodic_function() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut network =
        Network::feed_forward_with_rng(&mut rng, 1, &[32, 16, 8, 4, 2], 1).unwrap();

    for _ in 0..2500 {
        let x: f64 = rng.gen_range(-10.0..10.0);
        network.feed(&[x]).unwrap();
        network.train(TRAINING_RATE, &[periodic(x)]).unwrap();
    }

    let mut total = 0.0;
    for _ in 0..50 {
        let x: f64 = rng.gen_range(-10.0..10.0);
        let result = network.feed(&[x]).unwrap();
        total += math::mean_squared_error(&[periodic(x)], &result);
    }
    let mean_error = total / 50.0;
    assert!(mean_error < 0.1, "mean squared error was {mean_error}");
}

#[test]
fn compiled_deep_network_models_a_periodic_function() {
    let mut rng = StdRng::seed_from_u64(42);
    let network = Network::feed_forward_with_rng(&mut rng, 1, &[32, 16, 8, 4, 2], 1).unwrap();
    let mut vm = compile(&network).unwrap();

    for _ in 0..2500 {
        let x: f64 = rng.gen_range(-10.0..10.0);
        vm.feed(&[x]).unwrap();
        vm.train(TRAINING_RATE, &[periodic(x)]).unwrap();
    }

    let mut total = 0.0;
    for _ in 0..50 {
        let x: f64 = rng.gen_range(-10.0..10.0);
        let result = vm.feed(&[x]).unwrap();
        total += math::mean_squared_error(&[periodic(x)], &result);
    }
    let mean_error = total / 50.0;
    assert!(mean_error < 0.1, "mean squared error was {mean_error}");
}

#[test]
fn compiled_lstm_matches_the_reference_evaluator() {
    let mut rng = StdRng::seed_from_u64(1234);
    let mut reference = Network::long_short_term_memory_with_rng(&mut rng, 2, &[4], 1).unwrap();
    let mut vm = compile(&reference).unwrap();

    for step in 0..100 {
        let inputs = [rng.gen::<f64>(), rng.gen::<f64>()];
        let target = [rng.gen::<f64>()];
        let expected = reference.feed(&inputs).unwrap();
        let actual = vm.feed(&inputs).unwrap();
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(&actual) {
            assert!(
                (e - a).abs() < 1e-9,
                "outputs diverged at step {step}: {e} vs {a}"
            );
        }
        reference.train(TRAINING_RATE, &target).unwrap();
        vm.train(TRAINING_RATE, &target).unwrap();
    }
}

#[test]
fn compiled_feed_forward_matches_the_reference_evaluator() {
    let mut rng = StdRng::seed_from_u64(77);
    let mut reference = Network::feed_forward_with_rng(&mut rng, 2, &[20], 1).unwrap();
    let mut vm = compile(&reference).unwrap();

    for step in 0..200 {
        let inputs = [rng.gen::<f64>(), rng.gen::<f64>()];
        let target = [rng.gen::<f64>()];
        let expected = reference.feed(&inputs).unwrap();
        let actual = vm.feed(&inputs).unwrap();
        for (e, a) in expected.iter().zip(&actual) {
            assert!(
                (e - a).abs() < 1e-9,
                "outputs diverged at step {step}: {e} vs {a}"
            );
        }
        reference.train(TRAINING_RATE, &target).unwrap();
        vm.train(TRAINING_RATE, &target).unwrap();
    }
}
