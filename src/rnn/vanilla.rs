use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{add, add_repeated, matmul, Grad, Matrix, ResRef, Var, VarSet},
    error::{Error, Result},
    net::Layer,
    serializer::{BuildOptions, Codec, Tagged},
    tensor::Tensor,
};

use super::{take_pool, State, StateGrad, StepRes, VecState};

/// A recurrent layer computing `act(Ws * state + Wi * input + b)`, whose output is also its next
/// state.
#[derive(Clone, Debug)]
pub struct Vanilla {
    /// Input dimension.
    pub in_count: usize,
    /// Output and state dimension.
    pub out_count: usize,
    /// Row-major `out_count x out_count` state weights.
    pub state_weights: Var,
    /// Row-major `out_count x in_count` input weights.
    pub input_weights: Var,
    /// Output biases.
    pub biases: Var,
    /// Learnable initial state.
    pub start_state: Var,
    /// Applied to the weighted sum.
    pub activation: Layer,
}

impl Vanilla {
    /// Create a block with normal weights scaled by the inverse square roots of their fan-in.
    pub fn new<R, L>(in_count: usize, out_count: usize, activation: L, rng: &mut R) -> Self
    where
        R: Rng + ?Sized,
        L: Into<Layer>,
    {
        let res = Self::zero(in_count, out_count, activation);
        res.state_weights.set(Tensor::rand_normal(
            out_count * out_count,
            1.0 / (out_count as f64).sqrt(),
            rng,
        ));
        res.input_weights.set(Tensor::rand_normal(
            in_count * out_count,
            1.0 / (in_count as f64).sqrt(),
            rng,
        ));
        res
    }

    /// Create a block with all parameters set to zero.
    pub fn zero<L: Into<Layer>>(in_count: usize, out_count: usize, activation: L) -> Self {
        Self {
            in_count,
            out_count,
            state_weights: Var::new(Tensor::zeros(out_count * out_count)),
            input_weights: Var::new(Tensor::zeros(in_count * out_count)),
            biases: Var::new(Tensor::zeros(out_count)),
            start_state: Var::new(Tensor::zeros(out_count)),
            activation: activation.into(),
        }
    }

    pub(super) fn start(&self, n: usize) -> State {
        State::Vec(VecState::start(&self.start_state.value(), n))
    }

    pub(super) fn propagate_start(&self, state_grad: StateGrad, grad: &mut Grad) {
        state_grad
            .into_vec()
            .propagate_start(&self.start_state, grad);
    }

    pub(super) fn step(&self, state: &State, input: &Tensor) -> Box<dyn StepRes> {
        let state = state.expect_vec();
        let in_pool = Var::new(input.clone());
        let state_pool = Var::new(state.vector.clone());
        let n = state.present.num_present();

        let weighted_state =
            apply_weights(self.out_count, self.out_count, &self.state_weights, state_pool.res());
        let weighted_input =
            apply_weights(self.in_count, self.out_count, &self.input_weights, in_pool.res());
        let biased = add_repeated(add(weighted_state, weighted_input), self.biases.res());
        let out = self.activation.apply(biased, n);

        let mut vars = out.vars().clone();
        vars.del(in_pool.id());
        vars.del(state_pool.id());
        vars.add(&self.start_state);
        Box::new(VanillaRes {
            state: State::Vec(VecState {
                vector: out.output().clone(),
                present: state.present.clone(),
            }),
            in_pool,
            state_pool,
            out,
            vars,
        })
    }

    /// Return the state weights, input weights, biases, start state and activation parameters.
    pub fn parameters(&self) -> Vec<Var> {
        let mut res = vec![
            self.state_weights.clone(),
            self.input_weights.clone(),
            self.biases.clone(),
            self.start_state.clone(),
        ];
        res.extend(self.activation.parameters());
        res
    }
}

/// Multiply every `in_count`-vector of `batch` by an `out_count x in_count` matrix.
pub(super) fn apply_weights(
    in_count: usize,
    out_count: usize,
    weights: &Var,
    batch: ResRef,
) -> ResRef {
    let rows = batch.output().len() / in_count;
    let weights = Matrix::new(weights.res(), out_count, in_count);
    let inputs = Matrix::new(batch, rows, in_count);
    matmul(false, true, inputs, weights).data
}

struct VanillaRes {
    state: State,
    in_pool: Var,
    state_pool: Var,
    out: ResRef,
    vars: VarSet,
}

impl StepRes for VanillaRes {
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
        mut upstream: Tensor,
        state_upstream: Option<StateGrad>,
        grad: &mut Grad,
    ) -> (Tensor, StateGrad) {
        grad.insert_zero(&self.in_pool);
        grad.insert_zero(&self.state_pool);
        if let Some(s) = state_upstream {
            upstream += &s.into_vec().vector;
        }
        self.out.propagate(upstream, grad);
        let down = take_pool(grad, &self.in_pool);
        let down_state = take_pool(grad, &self.state_pool);
        (
            down,
            StateGrad::Vec(VecState {
                vector: down_state,
                present: self.state.present().clone(),
            }),
        )
    }
}

/// Stored parameters and activation of a [`Vanilla`] block.
#[derive(Serialize, Deserialize)]
pub struct VanillaRecord {
    state_weights: Tensor,
    input_weights: Tensor,
    biases: Tensor,
    start_state: Tensor,
    activation: Tagged,
}

impl Codec for Vanilla {
    const TYPE_ID: &'static str = "anynet.rnn.Vanilla";
    type Record = VanillaRecord;

    fn to_record(&self) -> Result<VanillaRecord> {
        Ok(VanillaRecord {
            state_weights: Tensor::clone(&self.state_weights.value()),
            input_weights: Tensor::clone(&self.input_weights.value()),
            biases: Tensor::clone(&self.biases.value()),
            start_state: Tensor::clone(&self.start_state.value()),
            activation: self.activation.to_tagged()?,
        })
    }

    fn from_record(r: VanillaRecord, opts: &BuildOptions) -> Result<Self> {
        let activation = Layer::from_tagged(&r.activation, opts)?;
        let out_count = r.biases.len();
        if out_count == 0
            || r.state_weights.len() != out_count * out_count
            || r.start_state.len() != out_count
            || r.input_weights.len() % out_count != 0
        {
            return Err(Error::InvalidData(format!(
                "inconsistent vanilla sizes for {out_count} outputs"
            )));
        }
        Ok(Self {
            in_count: r.input_weights.len() / out_count,
            out_count,
            state_weights: Var::new(r.state_weights),
            input_weights: Var::new(r.input_weights),
            biases: Var::new(r.biases),
            start_state: Var::new(r.start_state),
            activation,
        })
    }
}
