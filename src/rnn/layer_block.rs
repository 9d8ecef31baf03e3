use crate::{
    autodiff::{Grad, ResRef, Var, VarSet},
    error::Result,
    net::Layer,
    serializer::{BuildOptions, Codec, Tagged},
    tensor::Tensor,
};

use super::{take_pool, PresentMap, State, StateGrad, StepRes};

/// Applies a feed-forward layer to every timestep independently.
#[derive(Clone, Debug)]
pub struct LayerBlock {
    /// The wrapped layer.
    pub layer: Layer,
}

impl LayerBlock {
    /// Wrap a layer.
    pub fn new<L: Into<Layer>>(layer: L) -> Self {
        Self {
            layer: layer.into(),
        }
    }

    pub(super) fn start(&self, n: usize) -> State {
        State::Empty(PresentMap::all(n))
    }

    pub(super) fn step(&self, state: &State, input: &Tensor) -> Box<dyn StepRes> {
        let present = state.present().clone();
        let pool = Var::new(input.clone());
        let out = self.layer.apply(pool.res(), present.num_present());
        let mut vars = out.vars().clone();
        vars.del(pool.id());
        Box::new(LayerBlockRes {
            state: State::Empty(present),
            pool,
            out,
            vars,
        })
    }
}

struct LayerBlockRes {
    state: State,
    pool: Var,
    out: ResRef,
    vars: VarSet,
}

impl StepRes for LayerBlockRes {
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
        _: Option<StateGrad>,
        grad: &mut Grad,
    ) -> (Tensor, StateGrad) {
        grad.insert_zero(&self.pool);
        self.out.propagate(upstream, grad);
        let down = take_pool(grad, &self.pool);
        (down, StateGrad::Empty(self.state.present().clone()))
    }
}

impl Codec for LayerBlock {
    const TYPE_ID: &'static str = "anynet.rnn.LayerBlock";
    type Record = Tagged;

    fn to_record(&self) -> Result<Tagged> {
        self.layer.to_tagged()
    }

    fn from_record(layer: Tagged, opts: &BuildOptions) -> Result<Self> {
        Ok(Self {
            layer: Layer::from_tagged(&layer, opts)?,
        })
    }
}
