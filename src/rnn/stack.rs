use crate::{
    autodiff::{Grad, Var, VarSet},
    error::{Error, Result},
    serializer::{BuildOptions, Codec, Tagged},
    tensor::Tensor,
};

use super::{Block, State, StateGrad, StepRes};

/// Blocks applied in sequence, each feeding its output to the next.
#[derive(Clone, Debug, Default)]
pub struct Stack(pub Vec<Block>);

impl FromIterator<Block> for Stack {
    fn from_iter<I: IntoIterator<Item = Block>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Stack {
    fn assert_non_empty(&self) {
        assert!(!self.0.is_empty(), "empty stack is invalid");
    }

    pub(super) fn start(&self, n: usize) -> State {
        self.assert_non_empty();
        State::Stack(self.0.iter().map(|b| b.start(n)).collect())
    }

    pub(super) fn propagate_start(&self, state_grad: StateGrad, grad: &mut Grad) {
        let StateGrad::Stack(grads) = state_grad else {
            panic!("expected a stack state gradient");
        };
        for (block, g) in self.0.iter().zip(grads) {
            block.propagate_start(g, grad);
        }
    }

    pub(super) fn step(&self, state: &State, input: &Tensor) -> Box<dyn StepRes> {
        self.assert_non_empty();
        let State::Stack(states) = state else {
            panic!("expected a stack state");
        };
        assert_eq!(states.len(), self.0.len(), "stack state has wrong depth");
        let mut reses: Vec<Box<dyn StepRes>> = Vec::with_capacity(self.0.len());
        for (block, s) in self.0.iter().zip(states) {
            let res = match reses.last() {
                Some(prev) => block.step(s, prev.output()),
                None => block.step(s, input),
            };
            reses.push(res);
        }
        let vars = VarSet::merge(reses.iter().map(|r| r.vars()));
        let state = State::Stack(reses.iter().map(|r| r.state().clone()).collect());
        Box::new(StackRes { reses, state, vars })
    }

    /// Return the parameters of every block, in order.
    pub fn parameters(&self) -> Vec<Var> {
        self.0.iter().flat_map(Block::parameters).collect()
    }
}

struct StackRes {
    reses: Vec<Box<dyn StepRes>>,
    state: State,
    vars: VarSet,
}

impl StepRes for StackRes {
    fn state(&self) -> &State {
        &self.state
    }

    fn output(&self) -> &Tensor {
        self.reses[self.reses.len() - 1].output()
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
        let mut state_ups: Vec<Option<StateGrad>> = match state_upstream {
            Some(StateGrad::Stack(grads)) => grads.into_iter().map(Some).collect(),
            Some(_) => panic!("expected a stack state gradient"),
            None => vec![None; self.reses.len()],
        };
        let mut down = upstream;
        let mut down_states = Vec::with_capacity(self.reses.len());
        for res in self.reses.iter().rev() {
            let state_up = state_ups.pop().flatten();
            let (d, s) = res.propagate(down, state_up, grad);
            down = d;
            down_states.push(s);
        }
        down_states.reverse();
        (down, StateGrad::Stack(down_states))
    }
}

impl Codec for Stack {
    const TYPE_ID: &'static str = "anynet.rnn.Stack";
    type Record = Vec<Tagged>;

    fn to_record(&self) -> Result<Vec<Tagged>> {
        self.0.iter().map(Block::to_tagged).collect()
    }

    fn from_record(blocks: Vec<Tagged>, opts: &BuildOptions) -> Result<Self> {
        if blocks.is_empty() {
            return Err(Error::InvalidData("empty stack".into()));
        }
        let blocks: Vec<Block> = blocks
            .iter()
            .map(|t| Block::from_tagged(t, opts))
            .collect::<Result<_>>()?;
        Ok(Self(blocks))
    }
}
