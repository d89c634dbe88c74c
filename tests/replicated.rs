mod common;

use common::{Scale, assert_close, vector};
use layerflow::{
    Activation, Error, Linear, Module, ModuleChain, ReplicatedModule, Shape, StateBuffer,
    activation_functions::Tanh,
};

fn filled(shape: &[usize]) -> StateBuffer {
    let n: usize = shape.iter().product();
    StateBuffer::from_values(shape, (0..n).map(|i| i as f32 * 0.25 - 1.0).collect()).unwrap()
}

#[test]
fn scenario_c_call_counts() {
    let base = Scale::with_order(2.0, 2);
    let calls = base.calls();
    let mut replicated = ReplicatedModule::new(base).unwrap();
    let mut output = StateBuffer::default();

    replicated.evaluate(&filled(&[3, 4]), &mut output).unwrap();
    assert_eq!(calls.get(), 1);
    assert_eq!(output.shape(), &Shape::from([3, 4]));

    calls.set(0);
    let input = filled(&[5, 3, 4]);
    replicated.evaluate(&input, &mut output).unwrap();
    assert_eq!(calls.get(), 5);
    assert_eq!(output.shape(), &Shape::from([5, 3, 4]));
    for (&y, &x) in output.value().iter().zip(input.value()) {
        assert_eq!(y, 2.0 * x);
    }

    calls.set(0);
    replicated
        .evaluate(&filled(&[2, 3, 4, 5]), &mut output)
        .unwrap();
    assert_eq!(calls.get(), 2 * 3);
    assert_eq!(output.shape(), &Shape::from([2, 3, 4, 5]));
}

#[test]
fn backward_replays_each_slice() {
    let base = Scale::with_order(3.0, 1);
    let calls = base.calls();
    let mut replicated = ReplicatedModule::new(base).unwrap();
    let mut input = filled(&[4, 2]);
    let mut output = StateBuffer::default();
    replicated.evaluate(&input, &mut output).unwrap();
    output.gradient_mut().fill(1.0);
    output.curvature_mut().fill(1.0);

    calls.set(0);
    replicated.backpropagate(&mut input, &output).unwrap();
    assert_eq!(calls.get(), 4);
    assert_close(input.gradient(), &[3.0; 8]);

    replicated.curvature_backpropagate(&mut input, &output).unwrap();
    assert_close(input.curvature(), &[9.0; 8]);
}

#[test]
fn backward_without_replay_only_differentiates() {
    let base = Scale::with_order(3.0, 1);
    let calls = base.calls();
    let mut replicated = ReplicatedModule::new(base).unwrap().with_replay(false);
    assert!(!replicated.replays());
    let mut input = filled(&[4, 2]);
    let mut output = StateBuffer::default();
    replicated.evaluate(&input, &mut output).unwrap();
    assert_eq!(calls.get(), 4);
    output.gradient_mut().fill(1.0);
    output.curvature_mut().fill(1.0);

    replicated.backpropagate(&mut input, &output).unwrap();
    replicated.curvature_backpropagate(&mut input, &output).unwrap();
    assert_eq!(calls.get(), 4);
    assert_close(input.gradient(), &[3.0; 8]);
    assert_close(input.curvature(), &[9.0; 8]);
}

#[test]
fn stacked_copies_match_the_base() {
    let weights = |i: usize, j: usize| (i as f32 - 0.5 * j as f32) * 0.2 + 0.1;
    let x = [0.3, -1.2, 2.5];

    let mut direct = Linear::from_fn("fc", 3, 2, weights);
    let mut expected = StateBuffer::default();
    direct.evaluate(&vector(&x), &mut expected).unwrap();

    let mut replicated = ReplicatedModule::new(Linear::from_fn("fc", 3, 2, weights)).unwrap();
    let stacked = StateBuffer::from_values([4, 3], x.repeat(4)).unwrap();
    let mut output = StateBuffer::default();
    replicated.evaluate(&stacked, &mut output).unwrap();
    assert_eq!(output.shape(), &Shape::from([4, 2]));
    for row in output.value().chunks(2) {
        assert_eq!(row, expected.value());
    }
}

#[test]
fn rank_below_order() {
    let mut replicated = ReplicatedModule::with_order(Scale::new(1.0), 3).unwrap();
    let mut output = StateBuffer::default();
    assert_eq!(
        replicated.evaluate(&filled(&[2, 2]), &mut output),
        Err(Error::OrderMismatch {
            module: "replicated x1".into(),
            order: 3,
            rank: 2,
        })
    );
    assert!(ReplicatedModule::new(Scale::new(1.0)).is_err());
}

#[test]
fn inside_memory_optimized_chain() {
    let build = || {
        ModuleChain::new("rows")
            .with(
                ReplicatedModule::new(Linear::from_fn("a", 3, 2, |i, j| {
                    0.3 * i as f32 - 0.2 * j as f32 + 0.1
                }))
                .unwrap(),
            )
            .with(Activation::new(Tanh))
            .with(
                ReplicatedModule::new(Linear::from_fn("b", 2, 2, |i, j| {
                    if i == j { 1.5 } else { -0.5 }
                }))
                .unwrap(),
            )
    };
    fn run(chain: &mut dyn Module) -> (StateBuffer, StateBuffer) {
        let mut input = filled(&[4, 3]);
        let mut output = StateBuffer::default();
        chain.evaluate(&input, &mut output).unwrap();
        output.gradient_mut().fill(1.0);
        chain.backpropagate(&mut input, &output).unwrap();
        (input, output)
    }

    let mut standard = build();
    assert_eq!(
        standard.size_forward(&Shape::from([4, 3])),
        Ok(Shape::from([4, 2]))
    );
    let (input, output) = run(&mut standard);
    let (compiled_input, compiled_output) = run(&mut build().optimize_evaluate().unwrap());
    assert_eq!(output.value(), compiled_output.value());
    assert_close(compiled_input.gradient(), input.gradient());
    assert!(input.gradient().iter().any(|&g| g != 0.0));
}
