use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{add, add_repeated, mul, scale_repeated, Grad, ResRef, Var, VarSet},
    error::{Error, Result},
    net::{Activation, Layer},
    serializer::{BuildOptions, Codec, Tagged},
    tensor::Tensor,
};

use super::{take_pool, vanilla::apply_weights, State, StateGrad, StepRes, VecState};

const REMEMBER_BIAS: f64 = 1.0;

/// One gate of an [`Lstm`], computing
/// `act(Ws * last_out + Wi * input + peephole * internal + b)`.
#[derive(Clone, Debug)]
pub struct LstmGate {
    /// Row-major `state x state` weights applied to the previous output.
    pub state_weights: Var,
    /// Row-major `state x in` weights applied to the input.
    pub input_weights: Var,
    /// Elementwise weights applied to the cell state.
    pub peephole: Var,
    /// Biases.
    pub biases: Var,
    /// Gate nonlinearity.
    pub activation: Activation,
}

impl LstmGate {
    /// Create a gate with normal weights scaled by the inverse square roots of their fan-in.
    pub fn new<R: Rng + ?Sized>(
        in_count: usize,
        state_count: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let res = Self::zero(in_count, state_count, activation);
        res.state_weights.set(Tensor::rand_normal(
            state_count * state_count,
            1.0 / (state_count as f64).sqrt(),
            rng,
        ));
        res.input_weights.set(Tensor::rand_normal(
            state_count * in_count,
            1.0 / (in_count as f64).sqrt(),
            rng,
        ));
        res
    }

    /// Create a gate with all parameters set to zero.
    pub fn zero(in_count: usize, state_count: usize, activation: Activation) -> Self {
        Self {
            state_weights: Var::new(Tensor::zeros(state_count * state_count)),
            input_weights: Var::new(Tensor::zeros(state_count * in_count)),
            peephole: Var::new(Tensor::zeros(state_count)),
            biases: Var::new(Tensor::zeros(state_count)),
            activation,
        }
    }

    /// Apply the gate to packed previous outputs, inputs and cell states.
    pub fn apply(&self, last_out: ResRef, input: ResRef, internal: ResRef) -> ResRef {
        let out_count = self.biases.len();
        let in_count = self.input_weights.len() / out_count;
        let batch = last_out.output().len() / out_count;
        let weighted_state = apply_weights(out_count, out_count, &self.state_weights, last_out);
        let weighted_input = apply_weights(in_count, out_count, &self.input_weights, input);
        let peep = scale_repeated(internal, self.peephole.res());
        let sum = add(
            add(weighted_state, weighted_input),
            add_repeated(peep, self.biases.res()),
        );
        self.activation.apply(sum, batch)
    }

    /// Return the state weights, input weights, peephole and biases.
    pub fn parameters(&self) -> Vec<Var> {
        vec![
            self.state_weights.clone(),
            self.input_weights.clone(),
            self.peephole.clone(),
            self.biases.clone(),
        ]
    }
}

/// Parameters and nonlinearity of an [`LstmGate`].
#[derive(Serialize, Deserialize)]
pub struct LstmGateRecord {
    state_weights: Tensor,
    input_weights: Tensor,
    peephole: Tensor,
    biases: Tensor,
    activation: Activation,
}

impl Codec for LstmGate {
    const TYPE_ID: &'static str = "anynet.rnn.LSTMGate";
    type Record = LstmGateRecord;

    fn to_record(&self) -> Result<LstmGateRecord> {
        Ok(LstmGateRecord {
            state_weights: Tensor::clone(&self.state_weights.value()),
            input_weights: Tensor::clone(&self.input_weights.value()),
            peephole: Tensor::clone(&self.peephole.value()),
            biases: Tensor::clone(&self.biases.value()),
            activation: self.activation,
        })
    }

    fn from_record(r: LstmGateRecord, _: &BuildOptions) -> Result<Self> {
        let n = r.biases.len();
        if n == 0
            || r.state_weights.len() != n * n
            || r.peephole.len() != n
            || r.input_weights.len() % n != 0
        {
            return Err(Error::InvalidData(format!(
                "inconsistent LSTM gate sizes for state size {n}"
            )));
        }
        Ok(Self {
            state_weights: Var::new(r.state_weights),
            input_weights: Var::new(r.input_weights),
            peephole: Var::new(r.peephole),
            biases: Var::new(r.biases),
            activation: r.activation,
        })
    }
}

/// A long short-term memory block with peephole connections.
///
/// The output gate peeks at the updated cell state, while the other gates see the previous one.
/// The output is `output_gate * out_squash(internal)`, where `out_squash` defaults to tanh.
#[derive(Clone, Debug)]
pub struct Lstm {
    /// Candidate cell values.
    pub in_value: LstmGate,
    /// Input gate.
    pub input: LstmGate,
    /// Forget gate.
    pub remember: LstmGate,
    /// Output gate.
    pub output: LstmGate,
    /// Applied to the cell state before the output gate scales it.
    pub out_squash: Layer,
    /// Learnable initial output.
    pub init_last_out: Var,
    /// Learnable initial cell state.
    pub init_internal: Var,
}

impl Lstm {
    /// Create a randomly initialized block whose remember gate starts biased towards one.
    pub fn new<R: Rng + ?Sized>(in_count: usize, state_count: usize, rng: &mut R) -> Self {
        let res = Self {
            in_value: LstmGate::new(in_count, state_count, Activation::Tanh, rng),
            input: LstmGate::new(in_count, state_count, Activation::Sigmoid, rng),
            remember: LstmGate::new(in_count, state_count, Activation::Sigmoid, rng),
            output: LstmGate::new(in_count, state_count, Activation::Sigmoid, rng),
            out_squash: Activation::Tanh.into(),
            init_last_out: Var::new(Tensor::zeros(state_count)),
            init_internal: Var::new(Tensor::zeros(state_count)),
        };
        res.remember.biases.update(|b| b.add_scalar(REMEMBER_BIAS));
        res
    }

    /// Create a block with all parameters set to zero.
    pub fn zero(in_count: usize, state_count: usize) -> Self {
        Self {
            in_value: LstmGate::zero(in_count, state_count, Activation::Tanh),
            input: LstmGate::zero(in_count, state_count, Activation::Sigmoid),
            remember: LstmGate::zero(in_count, state_count, Activation::Sigmoid),
            output: LstmGate::zero(in_count, state_count, Activation::Sigmoid),
            out_squash: Activation::Tanh.into(),
            init_last_out: Var::new(Tensor::zeros(state_count)),
            init_internal: Var::new(Tensor::zeros(state_count)),
        }
    }

    /// Scale the input weights of every gate.
    pub fn scale_in_weights(self, s: f64) -> Self {
        for gate in self.gates() {
            gate.input_weights.update(|w| w.scale(s));
        }
        self
    }

    fn gates(&self) -> [&LstmGate; 4] {
        [&self.in_value, &self.input, &self.remember, &self.output]
    }

    pub(super) fn start(&self, n: usize) -> State {
        State::Lstm {
            last_out: VecState::start(&self.init_last_out.value(), n),
            internal: VecState::start(&self.init_internal.value(), n),
        }
    }

    pub(super) fn propagate_start(&self, state_grad: StateGrad, grad: &mut Grad) {
        let StateGrad::Lstm { last_out, internal } = state_grad else {
            panic!("expected an LSTM state gradient");
        };
        last_out.propagate_start(&self.init_last_out, grad);
        internal.propagate_start(&self.init_internal, grad);
    }

    pub(super) fn step(&self, state: &State, input: &Tensor) -> Box<dyn StepRes> {
        let State::Lstm { last_out, internal } = state else {
            panic!("expected an LSTM state");
        };
        let present = last_out.present.clone();
        let in_pool = Var::new(input.clone());
        let last_out_pool = Var::new(last_out.vector.clone());
        let last_internal_pool = Var::new(internal.vector.clone());

        let gate = |g: &LstmGate| g.apply(last_out_pool.res(), in_pool.res(), last_internal_pool.res());
        let in_val = gate(&self.in_value);
        let in_gate = gate(&self.input);
        let rem_gate = gate(&self.remember);
        let internal_res = add(
            mul(in_val, in_gate),
            mul(last_internal_pool.res(), rem_gate),
        );
        let internal_pool = Var::new(internal_res.output().clone());

        let out_gate = self
            .output
            .apply(last_out_pool.res(), in_pool.res(), internal_pool.res());
        let squashed = self
            .out_squash
            .apply(internal_pool.res(), present.num_present());
        let output_res = mul(out_gate, squashed);

        let vars = self.parameters().iter().collect();
        Box::new(LstmRes {
            state: State::Lstm {
                last_out: VecState {
                    vector: output_res.output().clone(),
                    present: present.clone(),
                },
                internal: VecState {
                    vector: internal_res.output().clone(),
                    present,
                },
            },
            vars,
            internal_res,
            output_res,
            in_pool,
            last_out_pool,
            last_internal_pool,
            internal_pool,
        })
    }

    /// Return the initial output and cell state, the parameters of every gate, then those of
    /// the output squash.
    pub fn parameters(&self) -> Vec<Var> {
        let mut res = vec![self.init_last_out.clone(), self.init_internal.clone()];
        for gate in self.gates() {
            res.extend(gate.parameters());
        }
        res.extend(self.out_squash.parameters());
        res
    }
}

struct LstmRes {
    state: State,
    vars: VarSet,
    internal_res: ResRef,
    output_res: ResRef,
    in_pool: Var,
    last_out_pool: Var,
    last_internal_pool: Var,
    internal_pool: Var,
}

impl StepRes for LstmRes {
    fn state(&self) -> &State {
        &self.state
    }

    fn output(&self) -> &Tensor {
        self.output_res.output()
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
        for p in [
            &self.in_pool,
            &self.last_out_pool,
            &self.last_internal_pool,
            &self.internal_pool,
        ] {
            grad.insert_zero(p);
        }

        let internal_upstream = match state_upstream {
            Some(StateGrad::Lstm { last_out, internal }) => {
                upstream += &last_out.vector;
                Some(internal.vector)
            }
            Some(_) => panic!("expected an LSTM state gradient"),
            None => None,
        };
        self.output_res.propagate(upstream, grad);

        let mut internal_grad = take_pool(grad, &self.internal_pool);
        if let Some(u) = internal_upstream {
            internal_grad += &u;
        }
        self.internal_res.propagate(internal_grad, grad);

        let present = self.state.present();
        let down_state = StateGrad::Lstm {
            last_out: VecState {
                vector: take_pool(grad, &self.last_out_pool),
                present: present.clone(),
            },
            internal: VecState {
                vector: take_pool(grad, &self.last_internal_pool),
                present: present.clone(),
            },
        };
        (take_pool(grad, &self.in_pool), down_state)
    }
}

/// Gates, output squash and initial state of an [`Lstm`].
#[derive(Serialize, Deserialize)]
pub struct LstmRecord {
    in_value: Tagged,
    input: Tagged,
    remember: Tagged,
    output: Tagged,
    out_squash: Tagged,
    init_last_out: Tensor,
    init_internal: Tensor,
}

impl Codec for Lstm {
    const TYPE_ID: &'static str = "anynet.rnn.LSTM";
    type Record = LstmRecord;

    fn to_record(&self) -> Result<LstmRecord> {
        Ok(LstmRecord {
            in_value: Tagged::new(&self.in_value)?,
            input: Tagged::new(&self.input)?,
            remember: Tagged::new(&self.remember)?,
            output: Tagged::new(&self.output)?,
            out_squash: self.out_squash.to_tagged()?,
            init_last_out: Tensor::clone(&self.init_last_out.value()),
            init_internal: Tensor::clone(&self.init_internal.value()),
        })
    }

    fn from_record(r: LstmRecord, opts: &BuildOptions) -> Result<Self> {
        let res = Self {
            in_value: r.in_value.decode(opts)?,
            input: r.input.decode(opts)?,
            remember: r.remember.decode(opts)?,
            output: r.output.decode(opts)?,
            out_squash: Layer::from_tagged(&r.out_squash, opts)?,
            init_last_out: Var::new(r.init_last_out),
            init_internal: Var::new(r.init_internal),
        };
        let n = res.init_last_out.len();
        let consistent = res.init_internal.len() == n
            && res.gates().iter().all(|g| {
                g.biases.len() == n && g.input_weights.len() == res.in_value.input_weights.len()
            });
        if !consistent {
            return Err(Error::InvalidData(format!(
                "inconsistent LSTM sizes for state size {n}"
            )));
        }
        Ok(res)
    }
}
