use dfdx::prelude::*;
use dfdx_linear::{
    persist::SafetensorsError, BuildModuleExt, Describe, Linear, LinearConfig, LinearError, Module, Parameter,
    Parameters, ResetParams, Sgd, Stack, UpdateParams,
};
use proptest::prelude::*;
use rand::{rngs::StdRng, SeedableRng};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tmp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("dfdx-linear-{}-{name}", std::process::id()))
}

#[test]
fn describes_both_bias_modes() {
    init_logging();
    let dev: Cpu = Default::default();
    let mut rng = StdRng::seed_from_u64(0);

    let with: Linear<f32, Cpu> = Linear::try_new(&dev, &mut rng, 10, 5, true).unwrap();
    let without: Linear<f32, Cpu> = Linear::try_new(&dev, &mut rng, 10, 5, false).unwrap();
    assert_eq!(with.describe(), "Linear (10->5) (with bias)");
    assert_eq!(without.describe(), "Linear (10->5) (without bias)");

    let stack = vec![with, without];
    assert_eq!(
        Stack(&stack).describe(),
        "[Linear (10->5) (with bias), Linear (10->5) (without bias)]"
    );
}

#[test]
fn rejects_bias_of_wrong_length() {
    init_logging();
    let dev: Cpu = Default::default();
    let weight = dev.zeros_like(&(4usize, 3usize));
    let bias = dev.zeros_like(&(3usize,));
    let res: Result<Linear<f32, Cpu>, _> = Linear::try_from_parts(weight, bias);
    assert!(matches!(res, Err(LinearError::InvalidArgument(_))));
}

#[test]
fn stack_of_layers_composes() {
    init_logging();
    let dev: Cpu = Default::default();
    let mut rng = StdRng::seed_from_u64(11);
    let mut net: Vec<Linear<f32, Cpu>> = vec![
        Linear::try_new(&dev, &mut rng, 4, 4, true).unwrap(),
        Linear::try_new(&dev, &mut rng, 4, 4, false).unwrap(),
    ];
    assert_eq!(net.parameters().len(), 3);
    assert_eq!(net.num_parameters(), 16 + 4 + 16);

    let x: Tensor<(usize, usize), f32, Cpu> = dev.zeros_like(&(3, 4));
    let y = net.forward_mut(x.clone());
    assert_eq!(*y.shape(), (3, 4));

    // zero input reaches the end as the first layer's bias pushed through the
    // second weight
    let expected = net[1].forward(net[0].forward(x));
    assert_eq!(y.as_vec(), expected.as_vec());

    let before = net[0].weight().as_vec();
    net.reset_params(&mut rng);
    assert_ne!(before, net[0].weight().as_vec());
}

#[test]
fn sgd_reduces_regression_loss() {
    init_logging();
    let dev: Cpu = Default::default();
    let mut rng = StdRng::seed_from_u64(42);
    let mut m: Linear<f32, Cpu> = Linear::try_new(&dev, &mut rng, 3, 2, true).unwrap();
    let target = Linear::try_from_parts(
        dev.tensor_from_vec(vec![0.5f32, -1.0, 2.0, 1.5, 0.0, -0.5], (2usize, 3usize)),
        dev.tensor_from_vec(vec![0.25f32, -0.75], (2usize,)),
    )
    .unwrap();

    let x = dev.tensor_from_vec(
        vec![
            1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, -1.0, 0.5, 2.0,
        ],
        (5usize, 3usize),
    );
    let y = target.forward(x.clone());

    let loss = |m: &Linear<f32, Cpu>| {
        let pred = m.forward(x.clone()).as_vec();
        let y = y.as_vec();
        pred.iter().zip(y.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f32>() / 10.0
    };

    let mut sgd = Sgd::new(0.5);
    let first = loss(&m);
    for _ in 0..300 {
        let pred = m.forward(x.leaky_trace());
        let mse = (pred - y.clone()).square().mean::<Rank0, _>();
        let mut grads = mse.backward();
        m.update_params(&mut sgd, &mut grads);
    }
    let last = loss(&m);
    assert!(last < first / 100.0, "loss went from {first} to {last}");
}

#[test]
fn safetensors_round_trip() {
    init_logging();
    let dev: Cpu = Default::default();
    let mut rng = StdRng::seed_from_u64(5);
    let path = tmp_path("round_trip.safetensors");

    let m: Linear<f64, Cpu> = Linear::try_new(&dev, &mut rng, 6, 3, true).unwrap();
    m.save_safetensors(&path).unwrap();
    let loaded: Linear<f64, Cpu> = Linear::try_load_safetensors(&dev, &path).unwrap();
    assert_eq!(loaded.describe(), m.describe());
    assert_eq!(loaded.weight().as_vec(), m.weight().as_vec());
    assert_eq!(loaded.bias().unwrap().as_vec(), m.bias().unwrap().as_vec());

    let m: Linear<f64, Cpu> = Linear::try_new(&dev, &mut rng, 6, 3, false).unwrap();
    m.save_safetensors(&path).unwrap();
    let loaded: Linear<f64, Cpu> = Linear::try_load_safetensors(&dev, &path).unwrap();
    assert!(!loaded.has_bias());

    // wrong element type
    assert!(matches!(
        Linear::<f32, Cpu>::try_load_safetensors(&dev, &path),
        Err(LinearError::Safetensors(SafetensorsError::Dtype { .. }))
    ));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn loading_mismatched_bias_fails() {
    init_logging();
    let dev: Cpu = Default::default();
    let path = tmp_path("mismatch.safetensors");
    let records = vec![
        (
            "weight".to_string(),
            dfdx_linear::persist::TensorRecord::new(vec![2, 2], &[1.0f32, 0.0, 0.0, 1.0]).unwrap(),
        ),
        (
            "bias".to_string(),
            dfdx_linear::persist::TensorRecord::new(vec![3], &[0.0f32; 3]).unwrap(),
        ),
    ];
    dfdx_linear::persist::save(&path, records).unwrap();
    assert!(matches!(
        Linear::<f32, Cpu>::try_load_safetensors(&dev, &path),
        Err(LinearError::InvalidArgument(_))
    ));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn config_builds_requested_layer() {
    init_logging();
    let dev: Cpu = Default::default();
    let mut rng = StdRng::seed_from_u64(3);
    let cfg = LinearConfig::new(8, 2).without_bias().with_negative_slope(5f64.sqrt());
    let m: Linear<f32, Cpu> = Linear::try_from_config(&dev, &mut rng, cfg).unwrap();
    assert_eq!(m.describe(), "Linear (8->2) (without bias)");
    // a² = 5 gives a bound of sqrt(1 / fan_in)
    let bound = (1.0f32 / 8.0).sqrt() + 1e-6;
    assert!(m.weight().as_vec().iter().all(|v| v.abs() <= bound));

    let m: Linear<f32, Cpu> = dev.build_module_ext::<f32, _>(LinearConfig::new(3, 2), &mut rng);
    assert_eq!(m.describe(), "Linear (3->2) (with bias)");
    assert!(m.bias().unwrap().as_vec().iter().any(|v| *v != 0.0));
}

#[test]
fn single_sample_matches_batch_row() {
    let dev: Cpu = Default::default();
    let mut rng = StdRng::seed_from_u64(9);
    let m: Linear<f32, Cpu> = Linear::try_new(&dev, &mut rng, 3, 2, true).unwrap();
    let row = dev.tensor_from_vec(vec![0.25f32, -0.5, 1.0], (3usize,));
    let batch = dev.tensor_from_vec(vec![0.25f32, -0.5, 1.0], (1usize, 3usize));
    assert_eq!(m.forward(row).as_vec(), m.forward(batch).as_vec());
}

#[test]
fn bias_gradient_is_batch_size() {
    let dev: Cpu = Default::default();
    let mut rng = StdRng::seed_from_u64(2);
    let m: Linear<f32, Cpu> = Linear::try_new(&dev, &mut rng, 2, 3, true).unwrap();
    let x: Tensor<(usize, usize, usize), f32, Cpu> = dev.zeros_like(&(2, 4, 2));
    let g = m.forward(x.leaky_trace()).sum::<Rank0, _>().backward();
    assert_eq!(g.get(m.bias().unwrap()).as_vec(), vec![8.0; 3]);
}

proptest! {
    #[test]
    fn parameter_shapes_follow_sizes(
        inp in 1usize..64,
        out in 1usize..64,
        bias in any::<bool>(),
        seed in any::<u64>(),
    ) {
        let dev: Cpu = Default::default();
        let mut rng = StdRng::seed_from_u64(seed);
        let m: Linear<f32, Cpu> = Linear::try_new(&dev, &mut rng, inp, out, bias).unwrap();

        let shapes: Vec<Vec<usize>> = m.parameters().iter().map(Parameter::shape).collect();
        let mut expected = vec![vec![out, inp]];
        if bias {
            expected.push(vec![out]);
        }
        prop_assert_eq!(shapes, expected);
        prop_assert_eq!(m.num_parameters(), out * inp + if bias { out } else { 0 });

        let w_bound = (3.0f32 / inp as f32).sqrt() + 1e-6;
        prop_assert!(m.weight().as_vec().iter().all(|v| v.abs() <= w_bound));
        if let Some(b) = m.bias() {
            let b_bound = 1.0 / (inp as f32).sqrt() + 1e-6;
            prop_assert!(b.as_vec().iter().all(|v| v.abs() <= b_bound));
        }

        let x: Tensor<(usize, usize), f32, Cpu> = dev.zeros_like(&(2, inp));
        prop_assert_eq!(*m.forward(x).shape(), (2, out));
    }
}

#[test]
fn heterogeneous_descriptions() {
    let dev: Cpu = Default::default();
    let mut rng = StdRng::seed_from_u64(4);
    let a: Linear<f32, Cpu> = Linear::try_new(&dev, &mut rng, 2, 3, true).unwrap();
    let b: Linear<f64, Cpu> = Linear::try_new(&dev, &mut rng, 3, 1, false).unwrap();
    let layers: Vec<Box<dyn Describe>> = vec![Box::new(a), Box::new(b)];
    let lines: Vec<String> = layers.iter().map(|l| l.describe()).collect();
    assert_eq!(
        lines,
        vec!["Linear (2->3) (with bias)", "Linear (3->1) (without bias)"]
    );
}
