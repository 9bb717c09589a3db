//! Kernel-level properties: emission determinism, slot discipline, shape
//! errors, scratch sharing, and state round-trips

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rnnforge::{compile, math, ForgeError, Network, VarRole};

const TRAINING_RATE: f64 = 0.25;

/// 2-2-1 network where both hidden neurons project to the output and gate a
/// connection into each other, so both compile down the projected-and-gating
/// path and share the error accumulator scratch
fn gated_fixture(seed: u64) -> Network {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut net = Network::new();
    let input = net.add_layer(2);
    let hidden = net.add_layer_with_rng(2, &mut rng);
    let output = net.add_layer_with_rng(1, &mut rng);
    let (i0, i1) = (net.layer(input)[0], net.layer(input)[1]);
    let (h0, h1) = (net.layer(hidden)[0], net.layer(hidden)[1]);
    let o = net.layer(output)[0];
    let c_i0_h0 = net.connect_with_rng(i0, h0, &mut rng).unwrap();
    net.connect_with_rng(i1, h0, &mut rng).unwrap();
    net.connect_with_rng(i0, h1, &mut rng).unwrap();
    let c_i1_h1 = net.connect_with_rng(i1, h1, &mut rng).unwrap();
    net.connect_with_rng(h0, o, &mut rng).unwrap();
    net.connect_with_rng(h1, o, &mut rng).unwrap();
    net.gate(h0, c_i1_h1).unwrap();
    net.gate(h1, c_i0_h0).unwrap();
    net
}

#[test]
fn single_connection_feed_is_exact() {
    let mut net = Network::new();
    let input = net.add_layer(1);
    let output = net.add_layer(1);
    let a = net.layer(input)[0];
    let b = net.layer(output)[0];
    net.connect_with_weight(a, b, 0.5).unwrap();
    net.neuron_mut(b).data.bias = 0.1;

    let mut vm = compile(&net).unwrap();
    for &x in &[0.0, 1.0, -2.5, 0.37, 10.0] {
        let result = vm.feed(&[x]).unwrap();
        assert_eq!(result.len(), 1);
        let expected = math::sigmoid(0.5 * x + 0.1);
        assert!(
            (result[0] - expected).abs() < 1e-12,
            "feed({x}) = {}, expected {expected}",
            result[0]
        );
    }
}

#[test]
fn compilation_is_deterministic() {
    let mut rng = StdRng::seed_from_u64(9);
    let net = Network::long_short_term_memory_with_rng(&mut rng, 2, &[3], 1).unwrap();
    let first = compile(&net).unwrap();
    let second = compile(&net).unwrap();
    assert_eq!(first.feed_kernel(), second.feed_kernel());
    assert_eq!(first.trace_kernel(), second.trace_kernel());
    assert_eq!(first.train_kernel(), second.train_kernel());
    assert_eq!(first.memory(), second.memory());
    assert_eq!(first.input_slots(), second.input_slots());
    assert_eq!(first.output_slots(), second.output_slots());
    assert_eq!(first.target_slots(), second.target_slots());
}

#[test]
fn error_accumulator_scratch_is_shared() {
    let net = gated_fixture(31);
    let vm = compile(&net).unwrap();
    let accumulators = (0..vm.memory().len())
        .filter(|&i| vm.context().role_of(rnnforge::Slot(i as u32)) == VarRole::ErrorAccumulator)
        .count();
    assert_eq!(accumulators, 1, "scratch must collide across neurons");
}

#[test]
fn shared_scratch_training_matches_private_accumulators() {
    // the reference evaluator keeps a private accumulator per neuron, so
    // agreement with it shows the shared scratch never leaks between
    // fragments of a sequential kernel
    let mut reference = gated_fixture(31);
    let mut vm = compile(&reference).unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    for step in 0..100 {
        let inputs = [rng.gen::<f64>(), rng.gen::<f64>()];
        let target = [rng.gen::<f64>()];
        let expected = reference.feed(&inputs).unwrap();
        let actual = vm.feed(&inputs).unwrap();
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-9, "diverged at step {step}: {e} vs {a}");
        }
        reference.train(TRAINING_RATE, &target).unwrap();
        vm.train(TRAINING_RATE, &target).unwrap();
    }
}

#[test]
fn feed_shape_mismatch_leaves_the_buffer_unchanged() {
    let net = gated_fixture(1);
    let mut vm = compile(&net).unwrap();
    let before = vm.memory().to_vec();
    match vm.feed(&[1.0, 2.0, 3.0]) {
        Err(ForgeError::ShapeMismatch { expected, actual }) => {
            assert_eq!(expected, 2);
            assert_eq!(actual, 3);
        }
        other => panic!("expected a shape mismatch, got {other:?}"),
    }
    assert_eq!(vm.memory(), before.as_slice());
}

#[test]
fn train_shape_mismatch_leaves_the_buffer_unchanged() {
    let net = gated_fixture(2);
    let mut vm = compile(&net).unwrap();
    vm.feed(&[0.5, 0.5]).unwrap();
    let before = vm.memory().to_vec();
    assert!(matches!(
        vm.train(TRAINING_RATE, &[1.0, 0.0]),
        Err(ForgeError::ShapeMismatch {
            expected: 1,
            actual: 2
        })
    ));
    assert_eq!(vm.memory(), before.as_slice());
}

#[test]
fn input_and_output_slots_follow_registration_order() {
    let mut rng = StdRng::seed_from_u64(13);
    let mut net = Network::feed_forward_with_rng(&mut rng, 3, &[4], 2).unwrap();
    let mut vm = compile(&net).unwrap();
    let inputs = [0.125, 0.5, 0.875];
    let outputs = vm.feed(&inputs).unwrap();

    // inputs land in the input slots in presentation order
    assert_eq!(vm.input_slots().len(), 3);
    for (slot, &value) in vm.input_slots().iter().zip(&inputs) {
        assert_eq!(vm.memory()[slot.index()], value);
    }
    // outputs come back in the output layer's traversal order
    let expected = net.feed(&inputs).unwrap();
    assert_eq!(outputs.len(), 2);
    for (e, a) in expected.iter().zip(&outputs) {
        assert!((e - a).abs() < 1e-9);
    }
}

#[test]
fn kernels_write_disjoint_slot_families() {
    let mut rng = StdRng::seed_from_u64(4);
    let net = Network::long_short_term_memory_with_rng(&mut rng, 2, &[3], 1).unwrap();
    let vm = compile(&net).unwrap();
    let role_of = |slot| vm.context().role_of(slot);

    for op in vm.feed_kernel().ops() {
        assert!(
            matches!(
                role_of(op.dst()),
                VarRole::Activation
                    | VarRole::State
                    | VarRole::OldState
                    | VarRole::Derivative
                    | VarRole::Gain
            ),
            "feed kernel writes a {:?} slot",
            role_of(op.dst())
        );
    }
    for op in vm.trace_kernel().ops() {
        assert!(
            matches!(
                role_of(op.dst()),
                VarRole::Influence | VarRole::Eligibility | VarRole::ExtendedTrace
            ),
            "trace kernel writes a {:?} slot",
            role_of(op.dst())
        );
    }
    // train writes responsibilities, the weight/bias family, and its scratch
    for op in vm.train_kernel().ops() {
        assert!(
            matches!(
                role_of(op.dst()),
                VarRole::ErrorResponsibility
                    | VarRole::ProjectedActivity
                    | VarRole::GatingActivity
                    | VarRole::Weight
                    | VarRole::Bias
                    | VarRole::ErrorAccumulator
                    | VarRole::Gradient
                    | VarRole::Influence
            ),
            "train kernel writes a {:?} slot",
            role_of(op.dst())
        );
    }
}

#[test]
fn restored_network_resumes_where_the_vm_left_off() {
    let mut rng = StdRng::seed_from_u64(0xabc);
    let original = Network::long_short_term_memory_with_rng(&mut rng, 2, &[3], 1).unwrap();
    let mut vm = compile(&original).unwrap();
    let mut restored = original.clone();

    for _ in 0..25 {
        let inputs = [rng.gen::<f64>(), rng.gen::<f64>()];
        vm.feed(&inputs).unwrap();
        vm.train(TRAINING_RATE, &[rng.gen::<f64>()]).unwrap();
    }
    vm.restore_into(&mut restored);

    // step k+1 agrees between the restored object graph and the VM
    for step in 0..5 {
        let inputs = [rng.gen::<f64>(), rng.gen::<f64>()];
        let target = [rng.gen::<f64>()];
        let expected = restored.feed(&inputs).unwrap();
        let actual = vm.feed(&inputs).unwrap();
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-9, "diverged at step {step}: {e} vs {a}");
        }
        restored.train(TRAINING_RATE, &target).unwrap();
        vm.train(TRAINING_RATE, &target).unwrap();
    }
}

#[test]
fn frozen_neurons_feed_but_never_learn() {
    let mut rng = StdRng::seed_from_u64(55);
    let mut net = Network::feed_forward_with_rng(&mut rng, 2, &[3], 1).unwrap();
    let frozen = net.layer(1)[1];
    net.freeze(frozen).unwrap();
    let frozen_weights: Vec<f64> = net
        .neuron(frozen)
        .incoming
        .iter()
        .map(|&c| net.connection(c).weight)
        .collect();

    let mut reference = net.clone();
    let mut vm = compile(&net).unwrap();
    for _ in 0..50 {
        let inputs = [rng.gen::<f64>(), rng.gen::<f64>()];
        let target = [rng.gen::<f64>()];
        let expected = reference.feed(&inputs).unwrap();
        let actual = vm.feed(&inputs).unwrap();
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-9);
        }
        reference.train(TRAINING_RATE, &target).unwrap();
        vm.train(TRAINING_RATE, &target).unwrap();
    }
    // the frozen neuron's incoming weights survived training on both sides
    for (i, &c) in reference.neuron(frozen).incoming.iter().enumerate() {
        assert_eq!(reference.connection(c).weight, frozen_weights[i]);
    }
    let mut restored = net.clone();
    vm.restore_into(&mut restored);
    for (i, &c) in restored.neuron(frozen).incoming.iter().enumerate() {
        assert_eq!(restored.connection(c).weight, frozen_weights[i]);
    }
}

#[test]
fn malformed_graphs_fail_before_emission() {
    let mut net = gated_fixture(3);
    let h0 = net.layer(1)[0];
    net.neuron_mut(h0).incoming.clear();
    assert!(matches!(
        compile(&net),
        Err(ForgeError::GraphInvariant(_))
    ));
}
