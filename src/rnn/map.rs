use std::rc::Rc;

use crate::{
    autodiff::{Grad, VarSet},
    seq::{self, Batch, PresentMap, Seq, SeqRef},
};

use super::{Block, State, StateGrad, StepRes};

type StartGrad = Box<dyn Fn(StateGrad, &mut Grad)>;

struct MapSeq {
    input: SeqRef,
    init_present: PresentMap,
    steps: Vec<Box<dyn StepRes>>,
    start_grad: StartGrad,
    out: Vec<Batch>,
    vars: VarSet,
}

/// Run a block over every timestep of a sequence batch, starting from [`Block::start`].
pub fn map(input: SeqRef, block: &Block) -> SeqRef {
    let Some(first) = input.output().first() else {
        return seq::constant(Vec::new());
    };
    let state = block.start(first.present.len());
    let start_block = block.clone();
    map_with_start(input, block, state, move |sg, grad| {
        start_block.propagate_start(sg, grad)
    })
}

/// Run a block over every timestep of a sequence batch from a given initial state.
///
/// The state is narrowed whenever sequences end. During back-propagation, the gradient of the
/// initial state is passed to `start_grad`, widened to cover the same sequences as `state`.
pub fn map_with_start<F>(input: SeqRef, block: &Block, state: State, start_grad: F) -> SeqRef
where
    F: Fn(StateGrad, &mut Grad) + 'static,
{
    if input.output().is_empty() {
        return seq::constant(Vec::new());
    }
    let init_present = state.present().clone();
    let mut state = state;
    let mut steps: Vec<Box<dyn StepRes>> = Vec::with_capacity(input.output().len());
    let mut out = Vec::with_capacity(input.output().len());
    let mut vars = input.vars().clone();
    for b in input.output() {
        if b.present.num_present() != state.present().num_present() {
            state = state.reduce(&b.present);
        }
        let step = block.step(&state, &b.packed);
        vars.extend(step.vars());
        out.push(Batch {
            packed: step.output().clone(),
            present: b.present.clone(),
        });
        state = step.state().clone();
        steps.push(step);
    }
    Rc::new(MapSeq {
        input,
        init_present,
        steps,
        start_grad: Box::new(start_grad),
        out,
        vars,
    })
}

impl Seq for MapSeq {
    fn output(&self) -> &[Batch] {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Vec<Batch>, grad: &mut Grad) {
        if upstream.is_empty() {
            return;
        }
        let need_input = grad.intersects(self.input.vars());
        let mut downstream = Vec::with_capacity(upstream.len());
        let mut up_state: Option<StateGrad> = None;
        for (step, u) in self.steps.iter().zip(upstream).rev() {
            let state_up = up_state.take().map(|s| {
                let present = step.state().present();
                if present.num_present() != s.present().num_present() {
                    s.expand(present)
                } else {
                    s
                }
            });
            let (down, down_state) = step.propagate(u.packed, state_up, grad);
            if need_input {
                downstream.push(Batch {
                    packed: down,
                    present: u.present,
                });
            }
            up_state = Some(down_state);
        }

        if let Some(mut s) = up_state {
            if s.present().num_present() != self.init_present.num_present() {
                s = s.expand(&self.init_present);
            }
            (self.start_grad)(s, grad);
        }

        if need_input {
            downstream.reverse();
            self.input.propagate(downstream, grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        autodiff::{check::ResChecker, ResRef, Var},
        net::{Activation, AddMixer, Affine, Fc, Layer, Net},
        rnn::{Feedback, LayerBlock, Lstm, Markov, Parallel, Stack, Vanilla},
        tensor::Tensor,
    };

    const IN: usize = 3;

    /// Three sequences of lengths 3, 1 and 2.
    fn presents() -> Vec<PresentMap> {
        vec![
            PresentMap::new(vec![true, true, true]),
            PresentMap::new(vec![true, false, true]),
            PresentMap::new(vec![true, false, false]),
        ]
    }

    fn inputs(rng: &mut StdRng) -> Vec<Var> {
        presents()
            .iter()
            .map(|p| Var::new(Tensor::rand_normal(p.num_present() * IN, 1.0, rng)))
            .collect()
    }

    fn input_seq(inputs: &[Var]) -> SeqRef {
        seq::from_res(
            inputs
                .iter()
                .zip(presents())
                .map(|(v, p)| (v.res(), p))
                .collect(),
        )
    }

    fn check_block(block: Block, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let ins = inputs(&mut rng);
        let mut vars = block.parameters();
        vars.extend(ins.iter().cloned());
        let f = || -> ResRef { seq::concat_all(map(input_seq(&ins), &block)) };
        let mut checker = ResChecker::new(f, vars);
        checker.prec = 1e-4;
        checker.assert_gradients();
    }

    fn randomize(block: &Block, rng: &mut StdRng) {
        for p in block.parameters() {
            p.set(Tensor::rand_normal(p.len(), 0.5, rng));
        }
    }

    fn mixer(rng: &mut StdRng, a: usize, b: usize, out: usize) -> AddMixer {
        AddMixer {
            in1: Fc::new(a, out, rng).into(),
            in2: Fc::new(b, out, rng).into(),
            out: Activation::Tanh.into(),
        }
    }

    #[test]
    fn output_shapes_follow_present_maps() {
        let mut rng = StdRng::seed_from_u64(0);
        let block: Block = Lstm::new(IN, 4, &mut rng).into();
        let out = map(input_seq(&inputs(&mut rng)), &block);
        let sizes: Vec<usize> = out.output().iter().map(|b| b.packed.len()).collect();
        assert_eq!(sizes, [12, 8, 4]);
        assert_eq!(out.output()[1].present, presents()[1]);
    }

    #[test]
    fn empty_input_gives_empty_output() {
        let mut rng = StdRng::seed_from_u64(0);
        let block: Block = Vanilla::new(IN, 2, Activation::Tanh, &mut rng).into();
        let out = map(seq::constant(Vec::new()), &block);
        assert!(out.output().is_empty());
        assert!(out.vars().is_empty());
    }

    #[test]
    fn layer_block_gradients() {
        let mut rng = StdRng::seed_from_u64(1);
        check_block(LayerBlock::new(Fc::new(IN, 2, &mut rng)).into(), 1);
    }

    #[test]
    fn vanilla_gradients() {
        let mut rng = StdRng::seed_from_u64(2);
        let block: Block = Vanilla::new(IN, 4, Activation::Tanh, &mut rng).into();
        randomize(&block, &mut rng);
        check_block(block, 2);
    }

    #[test]
    fn lstm_gradients() {
        let mut rng = StdRng::seed_from_u64(3);
        let block: Block = Lstm::new(IN, 3, &mut rng).into();
        randomize(&block, &mut rng);
        check_block(block, 3);
    }

    #[test]
    fn lstm_out_squash_gradients() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut lstm = Lstm::new(IN, 3, &mut rng);
        lstm.out_squash = Net(vec![
            Affine::from_vectors(Tensor::full(3, 1.0), Tensor::zeros(3)).into(),
            Activation::Sigmoid.into(),
        ])
        .into();
        let block: Block = lstm.into();
        randomize(&block, &mut rng);
        check_block(block, 8);
    }

    #[test]
    fn markov_gradients() {
        let mut rng = StdRng::seed_from_u64(9);
        for depth_wise in [false, true] {
            let mut markov = Markov::new(2, IN);
            markov.depth_wise = depth_wise;
            let block: Block = Stack(vec![
                markov.into(),
                Vanilla::new(3 * IN, 2, Activation::Tanh, &mut rng).into(),
            ])
            .into();
            randomize(&block, &mut rng);
            check_block(block, 9);
        }
    }

    #[test]
    fn stack_gradients() {
        let mut rng = StdRng::seed_from_u64(4);
        let block: Block = Stack(vec![
            Lstm::new(IN, 3, &mut rng).into(),
            LayerBlock::new(Layer::from(Fc::new(3, 2, &mut rng))).into(),
            Vanilla::new(2, 2, Activation::Sigmoid, &mut rng).into(),
        ])
        .into();
        randomize(&block, &mut rng);
        check_block(block, 4);
    }

    #[test]
    fn parallel_gradients() {
        let mut rng = StdRng::seed_from_u64(5);
        let block: Block = Parallel {
            block1: Vanilla::new(IN, 2, Activation::Tanh, &mut rng).into(),
            block2: Lstm::new(IN, 3, &mut rng).into(),
            mixer: mixer(&mut rng, 2, 3, 2),
        }
        .into();
        randomize(&block, &mut rng);
        check_block(block, 5);
    }

    #[test]
    fn feedback_gradients() {
        let mut rng = StdRng::seed_from_u64(6);
        let block: Block = Feedback {
            mixer: mixer(&mut rng, IN, 2, 4),
            block: Vanilla::new(4, 2, Activation::Tanh, &mut rng).into(),
            init_out: Var::new(Tensor::zeros(2)),
        }
        .into();
        randomize(&block, &mut rng);
        check_block(block, 6);
    }

    #[test]
    fn custom_start_state() {
        let mut rng = StdRng::seed_from_u64(7);
        let block: Block = Vanilla::new(IN, 2, Activation::Tanh, &mut rng).into();
        let start = Var::new(Tensor::rand_normal(6, 1.0, &mut rng));
        let ins = inputs(&mut rng);
        let f = || -> ResRef {
            let state = State::Vec(crate::rnn::VecState {
                vector: (*start.value()).clone(),
                present: PresentMap::all(3),
            });
            let start = start.clone();
            let out = map_with_start(input_seq(&ins), &block, state, move |sg, grad| {
                if let StateGrad::Vec(v) = sg {
                    grad.accumulate(start.id(), &v.vector);
                }
            });
            seq::concat_all(out)
        };
        let mut vars = block.parameters();
        vars.push(start.clone());
        ResChecker::new(f, vars).assert_gradients();
    }
}
