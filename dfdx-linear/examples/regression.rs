//! Fits a `Linear (4->2)` to a fixed target layer with plain SGD, then saves
//! the result.
//!
//! Run with `RUST_LOG=debug` to see construction and persistence logs.

use dfdx::prelude::*;
use dfdx_linear::{Describe, Linear, LinearConfig, Module, Sgd, UpdateParams};
use rand::{rngs::StdRng, SeedableRng};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let dev: Cpu = Default::default();
    let mut rng = StdRng::seed_from_u64(0);

    let target: Linear<f32, Cpu> = Linear::try_new(&dev, &mut rng, 4, 2, true)?;
    let cfg = LinearConfig::new(4, 2).with_negative_slope(0.0);
    let mut model: Linear<f32, Cpu> = Linear::try_from_config(&dev, &mut rng, cfg)?;
    println!("fitting {} to {}", model.describe(), target.describe());

    let mut sgd = Sgd::new(0.1);
    for step in 0..500 {
        let x: Tensor<(Const<16>, usize), f32, Cpu> = dev.sample_normal_like(&(Const, 4));
        let y = target.forward(x.clone());
        let loss = (model.forward(x.leaky_trace()) - y).square().mean::<Rank0, _>();
        if step % 100 == 0 {
            println!("step {step}: mse {}", loss.array());
        }
        let mut grads = loss.backward();
        model.update_params(&mut sgd, &mut grads);
    }

    let path = std::env::temp_dir().join("regression.safetensors");
    model.save_safetensors(&path)?;
    let reloaded: Linear<f32, Cpu> = Linear::try_load_safetensors(&dev, &path)?;
    println!("saved and reloaded {}", reloaded.describe());
    Ok(())
}
