use std::{cell::Cell, ops::Range};

use anynet::{
    autodiff::constant,
    conv::{BatchNorm, PostTrainer, Residual},
    ff::{self, Sample, SliceSampleList},
    net::{Activation, Fc, Layer, Net},
    sgd::Fetcher,
    tensor::Tensor,
    Error, Result,
};
use rand::{rngs::StdRng, SeedableRng};

fn samples(rng: &mut StdRng) -> SliceSampleList {
    SliceSampleList(
        (0..20)
            .map(|_| Sample {
                input: Tensor::rand_normal(3, 1.0, rng),
                output: Tensor::zeros(1),
            })
            .collect(),
    )
}

fn randomized_bn(n: usize, rng: &mut StdRng) -> BatchNorm {
    let bn = BatchNorm::new(n);
    bn.scalers.set(Tensor::rand_normal(n, 1.0, rng));
    bn.biases.set(Tensor::rand_normal(n, 1.0, rng));
    bn
}

fn full_output(net: &Net, samples: &SliceSampleList) -> Tensor {
    let batch = ff::fetch_batch(samples, 0..samples.0.len()).unwrap();
    net.apply(constant(batch.inputs), batch.num).output().clone()
}

fn assert_close(a: &Tensor, b: &Tensor) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.data().iter().zip(b.data()) {
        assert!((x - y).abs() < 1e-8, "{x} != {y}");
    }
}

#[test]
fn folding_preserves_full_batch_outputs() {
    let mut rng = StdRng::seed_from_u64(0);
    let samples = samples(&mut rng);
    let mut net = Net(vec![
        Fc::new(3, 4, &mut rng).into(),
        randomized_bn(4, &mut rng).into(),
        Activation::Tanh.into(),
    ]);
    let expected = full_output(&net, &samples);

    let trainer = ff::Trainer::new(Layer::Net(Net::default()), anynet::net::cost::Mse);
    PostTrainer::new(&samples, &trainer, 7, &mut net).run().unwrap();

    assert!(matches!(net.0[1], Layer::Affine(_)));
    assert_close(&full_output(&net, &samples), &expected);
}

#[test]
fn folding_descends_into_residuals() {
    let mut rng = StdRng::seed_from_u64(1);
    let samples = samples(&mut rng);
    let inner = Net(vec![
        Fc::new(4, 4, &mut rng).into(),
        randomized_bn(4, &mut rng).into(),
    ]);
    let mut net = Net(vec![
        Fc::new(3, 4, &mut rng).into(),
        Residual::new(inner).into(),
    ]);
    let expected = full_output(&net, &samples);

    let trainer = ff::Trainer::new(Layer::Net(Net::default()), anynet::net::cost::Mse);
    PostTrainer::new(&samples, &trainer, 0, &mut net).run().unwrap();

    let Layer::Residual(r) = &net.0[1] else {
        panic!("residual layer was replaced");
    };
    let Layer::Net(inner) = &r.layer else {
        panic!("residual body is not a network");
    };
    assert!(matches!(inner.0[1], Layer::Affine(_)));
    assert_close(&full_output(&net, &samples), &expected);
}

/// Fails every fetch after the first.
struct OneShotFetcher {
    calls: Cell<usize>,
}

impl Fetcher<SliceSampleList> for OneShotFetcher {
    type Batch = ff::Batch;

    fn fetch(&self, samples: &SliceSampleList, range: Range<usize>) -> Result<ff::Batch> {
        let calls = self.calls.get();
        self.calls.set(calls + 1);
        if calls > 0 {
            return Err(Error::InvalidData("source exhausted".into()));
        }
        ff::fetch_batch(samples, range)
    }
}

#[test]
fn failed_fetch_keeps_earlier_replacements() {
    let mut rng = StdRng::seed_from_u64(2);
    let samples = samples(&mut rng);
    let mut net = Net(vec![
        randomized_bn(3, &mut rng).into(),
        Fc::new(3, 2, &mut rng).into(),
        randomized_bn(2, &mut rng).into(),
    ]);
    let fetcher = OneShotFetcher {
        calls: Cell::new(0),
    };
    let err = PostTrainer::new(&samples, &fetcher, 0, &mut net)
        .run()
        .unwrap_err();

    assert!(err.to_string().contains("source exhausted"), "{err}");
    assert_eq!(net.0.len(), 3);
    assert!(matches!(net.0[0], Layer::Affine(_)));
    assert!(matches!(net.0[2], Layer::BatchNorm(_)));
}
