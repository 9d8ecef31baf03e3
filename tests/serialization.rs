use anynet::{
    autodiff::{constant, Var},
    conv::{
        BatchNorm, Conv, ConvShape, ConvStrategy, MaxPool, MeanPool, Padding, Residual, Resize,
    },
    net::{
        Activation, AddMixer, Affine, ConstAffine, DebugLayer, Dropout, Fc, Layer, Net, ParamHider,
    },
    rnn::{self, Bidir, Block, Feedback, LayerBlock, Lstm, Markov, Parallel, Stack, Vanilla},
    seq,
    serializer::{self, BuildOptions, Tagged},
    tensor::Tensor,
    Error,
};
use rand::{rngs::StdRng, SeedableRng};

fn assert_same_output(a: &Layer, b: &Layer, in_size: usize, batch: usize, rng: &mut StdRng) {
    let input = Tensor::rand_normal(in_size * batch, 1.0, rng);
    let x = a.apply(constant(input.clone()), batch);
    let y = b.apply(constant(input), batch);
    assert_eq!(x.output(), y.output());
}

fn conv_net(rng: &mut StdRng) -> Net {
    let shape = ConvShape {
        filter_count: 4,
        filter_width: 3,
        filter_height: 3,
        stride_x: 1,
        stride_y: 1,
        input_width: 8,
        input_height: 8,
        input_depth: 2,
    };
    let bn = BatchNorm::new(4);
    bn.scalers.set(Tensor::rand_normal(4, 1.0, rng));
    Net(vec![
        Padding::new((6, 6, 2), (1, 1, 1, 1)).into(),
        Conv::new_rand(shape, ConvStrategy::Serial, rng).into(),
        bn.into(),
        Activation::ReLU.into(),
        Residual::with_projection(
            Net(vec![Affine::from_vectors(
                Tensor::rand_normal(4, 1.0, rng),
                Tensor::rand_normal(4, 1.0, rng),
            )
            .into()]),
            ConstAffine { scale: 0.5, bias: -1.0 },
        )
        .into(),
        MaxPool::new((2, 2), (6, 6, 4)).into(),
        Resize::new(4, (3, 3), (5, 5)).into(),
        MeanPool::new((2, 2), (5, 5, 4)).into(),
        DebugLayer::default().into(),
        Dropout {
            enabled: false,
            keep_prob: 0.8,
        }
        .into(),
        ParamHider::new(Fc::new(36, 3, rng)).into(),
        Activation::LogSoftmax.into(),
    ])
}

#[test]
fn layer_round_trip() {
    let mut rng = StdRng::seed_from_u64(0);
    let layer: Layer = conv_net(&mut rng).into();
    let data = layer.serialize().unwrap();
    let decoded = Layer::deserialize(&data, &BuildOptions::default()).unwrap();

    assert_eq!(decoded.type_id(), layer.type_id());
    assert_eq!(decoded.parameters().len(), layer.parameters().len());
    assert_same_output(&layer, &decoded, 6 * 6 * 2, 3, &mut rng);
    assert_eq!(decoded.serialize().unwrap(), data);
}

#[test]
fn decode_options_pick_conv_strategy() {
    let mut rng = StdRng::seed_from_u64(1);
    let net = conv_net(&mut rng);
    let data = serializer::serialize(&net).unwrap();
    let opts = BuildOptions {
        conv: ConvStrategy::Parallel,
    };
    let decoded: Net = serializer::deserialize(&data, &opts).unwrap();
    let Layer::Conv(c) = &decoded.0[1] else {
        panic!("expected a conv layer");
    };
    assert_eq!(c.strategy, ConvStrategy::Parallel);
    assert_same_output(&net.into(), &decoded.into(), 6 * 6 * 2, 2, &mut rng);
}

fn mixer(a: usize, b: usize, out: usize, rng: &mut StdRng) -> AddMixer {
    AddMixer {
        in1: Fc::new(a, out, rng).into(),
        in2: Fc::new(b, out, rng).into(),
        out: Activation::Tanh.into(),
    }
}

fn sequences(rng: &mut StdRng) -> Vec<Vec<Tensor>> {
    [4, 2, 3]
        .iter()
        .map(|&n| (0..n).map(|_| Tensor::rand_normal(3, 1.0, rng)).collect())
        .collect()
}

#[test]
fn block_round_trip() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut markov = Markov::new(2, 4);
    markov.depth_wise = true;
    markov.start_state.set(Tensor::rand_normal(8, 1.0, &mut rng));
    let block: Block = Stack(vec![
        Lstm::new(3, 4, &mut rng).into(),
        markov.into(),
        LayerBlock::new(Fc::new(12, 4, &mut rng)).into(),
        Parallel {
            block1: Vanilla::new(4, 2, Activation::Tanh, &mut rng).into(),
            block2: LayerBlock::new(Fc::new(4, 3, &mut rng)).into(),
            mixer: mixer(2, 3, 3, &mut rng),
        }
        .into(),
        Feedback {
            mixer: mixer(3, 2, 2, &mut rng),
            block: Vanilla::new(2, 2, Activation::Sigmoid, &mut rng).into(),
            init_out: Var::new(Tensor::rand_normal(2, 1.0, &mut rng)),
        }
        .into(),
    ])
    .into();

    let data = block.serialize().unwrap();
    let decoded = Block::deserialize(&data, &BuildOptions::default()).unwrap();
    assert_eq!(decoded.type_id(), "anynet.rnn.Stack");
    assert_eq!(decoded.parameters().len(), block.parameters().len());
    let Block::Stack(Stack(parts)) = &decoded else {
        panic!("expected a stack");
    };
    let Block::Markov(m) = &parts[1] else {
        panic!("expected a Markov block");
    };
    assert!(m.depth_wise);
    assert_eq!(m.history_size, 2);

    let inputs = sequences(&mut rng);
    let a = rnn::map(seq::const_seq_list(&inputs), &block);
    let b = rnn::map(seq::const_seq_list(&inputs), &decoded);
    assert_eq!(a.output(), b.output());
}

#[test]
fn lstm_out_squash_is_kept() {
    let mut rng = StdRng::seed_from_u64(5);
    let default = Lstm::new(3, 2, &mut rng);
    let mut lstm = default.clone();
    lstm.out_squash = Affine::from_vectors(
        Tensor::rand_normal(2, 1.0, &mut rng),
        Tensor::rand_normal(2, 1.0, &mut rng),
    )
    .into();
    let block: Block = lstm.into();
    let data = block.serialize().unwrap();
    let decoded = Block::deserialize(&data, &BuildOptions::default()).unwrap();
    let Block::Lstm(l) = &decoded else {
        panic!("expected an LSTM");
    };
    assert_eq!(l.out_squash.type_id(), "anynet.Affine");
    assert_eq!(decoded.parameters().len(), default.parameters().len() + 2);

    let inputs = sequences(&mut rng);
    let a = rnn::map(seq::const_seq_list(&inputs), &block);
    let b = rnn::map(seq::const_seq_list(&inputs), &decoded);
    let c = rnn::map(seq::const_seq_list(&inputs), &default.into());
    assert_eq!(a.output(), b.output());
    assert_ne!(a.output(), c.output());
}

#[test]
fn bidir_round_trip() {
    let mut rng = StdRng::seed_from_u64(6);
    let bidir = Bidir {
        forward: Lstm::new(3, 2, &mut rng).into(),
        backward: Markov::new(1, 3).into(),
        mixer: mixer(2, 6, 2, &mut rng),
    };
    let data = serializer::serialize(&bidir).unwrap();
    let decoded: Bidir = serializer::deserialize(&data, &BuildOptions::default()).unwrap();
    assert_eq!(decoded.backward.type_id(), "anynet.rnn.Markov");
    assert_eq!(decoded.parameters().len(), bidir.parameters().len());

    let inputs = sequences(&mut rng);
    let a = bidir.apply(seq::const_seq_list(&inputs));
    let b = decoded.apply(seq::const_seq_list(&inputs));
    assert_eq!(a.output(), b.output());
}

#[test]
fn unknown_tag_is_rejected() {
    let data = serializer::to_bytes(&Tagged {
        type_id: "anynet.NoSuchLayer".into(),
        payload: Vec::new(),
    })
    .unwrap();
    let err = Layer::deserialize(&data, &BuildOptions::default()).unwrap_err();
    assert!(matches!(err, Error::UnknownType(ref t) if t == "anynet.NoSuchLayer"), "{err}");
}

#[test]
fn truncated_data_is_an_error() {
    let mut rng = StdRng::seed_from_u64(3);
    let data = Layer::from(Fc::new(3, 2, &mut rng)).serialize().unwrap();
    for cut in [0, 3, data.len() / 2, data.len() - 1] {
        let err = Layer::deserialize(&data[..cut], &BuildOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)), "{err}");
    }
}

#[test]
fn trailing_bytes_are_an_error() {
    let mut data = Layer::from(Activation::Sin).serialize().unwrap();
    data.push(0);
    let err = Layer::deserialize(&data, &BuildOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Encoding(_)), "{err}");
}

#[test]
fn nested_errors_name_the_failing_type() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut lstm = Lstm::new(3, 2, &mut rng);
    lstm.init_internal = Var::new(Tensor::zeros(5));
    let data = Block::from(lstm).serialize().unwrap();
    let err = Block::deserialize(&data, &BuildOptions::default()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "deserialize anynet.rnn.LSTM: invalid data: inconsistent LSTM sizes for state size 2"
    );
}
