use anynet::{
    autodiff::constant,
    ff::{Sample, SliceSampleList, Trainer},
    net::{cost::Mse, Activation, Fc, Layer, Net},
    serializer::BuildOptions,
    sgd::{Adam, Sgd, StepLimit},
    tensor::Tensor,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing_subscriber::EnvFilter;

fn dataset_add<R: Rng>(rng: &mut R) -> SliceSampleList {
    let samples = (0..1000)
        .map(|_| {
            let x: f64 = rng.sample(StandardNormal);
            let y: f64 = rng.sample(StandardNormal);
            Sample {
                input: Tensor::from(vec![x, y]),
                output: Tensor::from(vec![x + y]),
            }
        })
        .collect();
    SliceSampleList(samples)
}

fn dataset_gate<R: Rng, F: Fn(bool, bool) -> bool>(rng: &mut R, gate: F) -> SliceSampleList {
    let convert = |x| if x { 1.0 } else { 0.0 };
    let samples = (0..1000)
        .map(|_| {
            let x = rng.gen_bool(0.5);
            let y = rng.gen_bool(0.5);
            Sample {
                input: Tensor::from(vec![convert(x), convert(y)]),
                output: Tensor::from(vec![convert(gate(x, y))]),
            }
        })
        .collect();
    SliceSampleList(samples)
}

fn train_eval(
    name: &str,
    net: Net,
    samples: SliceSampleList,
    steps: usize,
    rate: f64,
) -> anynet::Result<Layer> {
    let net = Layer::from(net);
    tracing::info!(name, parameters = net.parameters().len(), "training");

    let mut sgd = Sgd::new(Trainer::new(net, Mse), samples, rate, 100);
    sgd.rng = StdRng::seed_from_u64(1);
    sgd.transformer = Some(Box::new(Adam::default()));
    let mut step = 0;
    sgd.run_with_status(&mut StepLimit(steps), |trainer, _| {
        if step % 100 == 0 {
            tracing::info!(name, step, cost = trainer.last_cost, "status");
        }
        step += 1;
    })?;

    let net = sgd.trainer.net;
    for inputs in [[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]] {
        let out = net.apply(constant(Tensor::from(inputs.to_vec())), 1);
        tracing::info!(name, ?inputs, prediction = out.output()[0], "evaluated");
    }
    Ok(net)
}

fn main() -> anynet::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut rng = StdRng::seed_from_u64(0);

    let add = Net(vec![Fc::new(2, 1, &mut rng).into()]);
    let samples = dataset_add(&mut rng);
    train_eval("add", add, samples, 500, 0.05)?;

    let and = Net(vec![Fc::new(2, 1, &mut rng).into(), Activation::Sigmoid.into()]);
    let samples = dataset_gate(&mut rng, |x, y| x & y);
    train_eval("and", and, samples, 1000, 0.05)?;

    let xor = Net(vec![
        Fc::new(2, 4, &mut rng).into(),
        Activation::Tanh.into(),
        Fc::new(4, 1, &mut rng).into(),
        Activation::Sigmoid.into(),
    ]);
    let samples = dataset_gate(&mut rng, |x, y| x ^ y);
    let trained = train_eval("xor", xor, samples, 2000, 0.05)?;

    let data = trained.serialize()?;
    let restored = Layer::deserialize(&data, &BuildOptions::default())?;
    let input = constant(Tensor::from(vec![1.0, 0.0]));
    tracing::info!(
        bytes = data.len(),
        original = trained.apply(input.clone(), 1).output()[0],
        restored = restored.apply(input, 1).output()[0],
        "round-tripped the xor network"
    );
    Ok(())
}
