use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{Grad, ResRef, Var, VarSet},
    error::Result,
    net::AddMixer,
    serializer::{BuildOptions, Codec, Tagged},
    tensor::Tensor,
};

use super::{take_pool, Block, State, StateGrad, StepRes, VecState};

/// Feeds a block the mix of its input and its own previous output.
#[derive(Clone, Debug)]
pub struct Feedback {
    /// Combines the input (first) with the previous output (second).
    pub mixer: AddMixer,
    /// The wrapped block.
    pub block: Block,
    /// Learnable output seen by the first timestep.
    pub init_out: Var,
}

impl Feedback {
    pub(super) fn start(&self, n: usize) -> State {
        State::Feedback {
            block: Box::new(self.block.start(n)),
            last_out: VecState::start(&self.init_out.value(), n),
        }
    }

    pub(super) fn propagate_start(&self, state_grad: StateGrad, grad: &mut Grad) {
        let StateGrad::Feedback { block, last_out } = state_grad else {
            panic!("expected a feedback state gradient");
        };
        self.block.propagate_start(*block, grad);
        last_out.propagate_start(&self.init_out, grad);
    }

    pub(super) fn step(&self, state: &State, input: &Tensor) -> Box<dyn StepRes> {
        let State::Feedback { block, last_out } = state else {
            panic!("expected a feedback state");
        };
        let present = state.present().clone();
        let in_pool = Var::new(input.clone());
        let last_out_pool = Var::new(last_out.vector.clone());
        let mixed = self
            .mixer
            .mix(in_pool.res(), last_out_pool.res(), present.num_present());
        let block_res = self.block.step(block, mixed.output());

        let mut vars: VarSet = self.mixer.parameters().iter().collect();
        vars.add(&self.init_out);
        vars.extend(block_res.vars());
        let state = State::Feedback {
            block: Box::new(block_res.state().clone()),
            last_out: VecState {
                vector: block_res.output().clone(),
                present,
            },
        };
        Box::new(FeedbackRes {
            in_pool,
            last_out_pool,
            mixed,
            block_res,
            state,
            vars,
        })
    }

    /// Return the parameters of the mixer and block, then the initial output.
    pub fn parameters(&self) -> Vec<Var> {
        let mut res = self.mixer.parameters();
        res.extend(self.block.parameters());
        res.push(self.init_out.clone());
        res
    }
}

struct FeedbackRes {
    in_pool: Var,
    last_out_pool: Var,
    mixed: ResRef,
    block_res: Box<dyn StepRes>,
    state: State,
    vars: VarSet,
}

impl StepRes for FeedbackRes {
    fn state(&self) -> &State {
        &self.state
    }

    fn output(&self) -> &Tensor {
        self.block_res.output()
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(
        &self,
        mut upstream: Tensor,
        state_upstream: Option<StateGrad>,
        grad: &mut Grad,
    ) -> (Tensor, StateGrad) {
        grad.insert_zero(&self.in_pool);
        grad.insert_zero(&self.last_out_pool);
        let block_upstream = match state_upstream {
            Some(StateGrad::Feedback { block, last_out }) => {
                upstream += &last_out.vector;
                Some(*block)
            }
            Some(_) => panic!("expected a feedback state gradient"),
            None => None,
        };
        let (mixed_down, block_down) = self.block_res.propagate(upstream, block_upstream, grad);
        self.mixed.propagate(mixed_down, grad);
        let down = take_pool(grad, &self.in_pool);
        let last_out = VecState {
            vector: take_pool(grad, &self.last_out_pool),
            present: self.state.present().clone(),
        };
        (
            down,
            StateGrad::Feedback {
                block: Box::new(block_down),
                last_out,
            },
        )
    }
}

/// The mixer, wrapped block and initial output of a [`Feedback`] block.
#[derive(Serialize, Deserialize)]
pub struct FeedbackRecord {
    mixer: Tagged,
    block: Tagged,
    init_out: Tensor,
}

impl Codec for Feedback {
    const TYPE_ID: &'static str = "anynet.rnn.Feedback";
    type Record = FeedbackRecord;

    fn to_record(&self) -> Result<FeedbackRecord> {
        Ok(FeedbackRecord {
            mixer: Tagged::new(&self.mixer)?,
            block: self.block.to_tagged()?,
            init_out: Tensor::clone(&self.init_out.value()),
        })
    }

    fn from_record(r: FeedbackRecord, opts: &BuildOptions) -> Result<Self> {
        Ok(Self {
            mixer: r.mixer.decode(opts)?,
            block: Block::from_tagged(&r.block, opts)?,
            init_out: Var::new(r.init_out),
        })
    }
}
