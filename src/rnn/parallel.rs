use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{Grad, ResRef, Var, VarSet},
    error::Result,
    net::AddMixer,
    serializer::{BuildOptions, Codec, Tagged},
    tensor::Tensor,
};

use super::{take_pool, Block, State, StateGrad, StepRes};

/// Runs two blocks on the same input and mixes their outputs.
#[derive(Clone, Debug)]
pub struct Parallel {
    /// The first block.
    pub block1: Block,
    /// The second block.
    pub block2: Block,
    /// Combines the two outputs.
    pub mixer: AddMixer,
}

impl Parallel {
    pub(super) fn start(&self, n: usize) -> State {
        State::Parallel(Box::new(self.block1.start(n)), Box::new(self.block2.start(n)))
    }

    pub(super) fn propagate_start(&self, state_grad: StateGrad, grad: &mut Grad) {
        let StateGrad::Parallel(g1, g2) = state_grad else {
            panic!("expected a parallel state gradient");
        };
        self.block1.propagate_start(*g1, grad);
        self.block2.propagate_start(*g2, grad);
    }

    pub(super) fn step(&self, state: &State, input: &Tensor) -> Box<dyn StepRes> {
        let State::Parallel(s1, s2) = state else {
            panic!("expected a parallel state");
        };
        let res1 = self.block1.step(s1, input);
        let res2 = self.block2.step(s2, input);
        let pool1 = Var::new(res1.output().clone());
        let pool2 = Var::new(res2.output().clone());
        let out = self
            .mixer
            .mix(pool1.res(), pool2.res(), state.present().num_present());

        let mut vars = out.vars().clone();
        vars.del(pool1.id());
        vars.del(pool2.id());
        vars.extend(res1.vars());
        vars.extend(res2.vars());
        let state = State::Parallel(
            Box::new(res1.state().clone()),
            Box::new(res2.state().clone()),
        );
        Box::new(ParallelRes {
            res1,
            res2,
            pool1,
            pool2,
            out,
            state,
            vars,
        })
    }

    /// Return the parameters of both blocks and the mixer.
    pub fn parameters(&self) -> Vec<Var> {
        let mut res = self.block1.parameters();
        res.extend(self.block2.parameters());
        res.extend(self.mixer.parameters());
        res
    }
}

struct ParallelRes {
    res1: Box<dyn StepRes>,
    res2: Box<dyn StepRes>,
    pool1: Var,
    pool2: Var,
    out: ResRef,
    state: State,
    vars: VarSet,
}

impl StepRes for ParallelRes {
    fn state(&self) -> &State {
        &self.state
    }

    fn output(&self) -> &Tensor {
        self.out.output()
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(
        &self,
        upstream: Tensor,
        state_upstream: Option<StateGrad>,
        grad: &mut Grad,
    ) -> (Tensor, StateGrad) {
        grad.insert_zero(&self.pool1);
        grad.insert_zero(&self.pool2);
        self.out.propagate(upstream, grad);
        let up1 = take_pool(grad, &self.pool1);
        let up2 = take_pool(grad, &self.pool2);

        let (sg1, sg2) = match state_upstream {
            Some(StateGrad::Parallel(g1, g2)) => (Some(*g1), Some(*g2)),
            Some(_) => panic!("expected a parallel state gradient"),
            None => (None, None),
        };
        let (mut down, down1) = self.res1.propagate(up1, sg1, grad);
        let (down2, down2_state) = self.res2.propagate(up2, sg2, grad);
        down += &down2;
        (
            down,
            StateGrad::Parallel(Box::new(down1), Box::new(down2_state)),
        )
    }
}

/// Both blocks and the mixer of a [`Parallel`] block.
#[derive(Serialize, Deserialize)]
pub struct ParallelRecord {
    block1: Tagged,
    block2: Tagged,
    mixer: Tagged,
}

impl Codec for Parallel {
    const TYPE_ID: &'static str = "anynet.rnn.Parallel";
    type Record = ParallelRecord;

    fn to_record(&self) -> Result<ParallelRecord> {
        Ok(ParallelRecord {
            block1: self.block1.to_tagged()?,
            block2: self.block2.to_tagged()?,
            mixer: Tagged::new(&self.mixer)?,
        })
    }

    fn from_record(r: ParallelRecord, opts: &BuildOptions) -> Result<Self> {
        Ok(Self {
            block1: Block::from_tagged(&r.block1, opts)?,
            block2: Block::from_tagged(&r.block2, opts)?,
            mixer: r.mixer.decode(opts)?,
        })
    }
}
