//! Recurrent blocks and the driver that runs them over sequence batches.
//!
//! A [`Block`] turns a [`State`] and one timestep of input into an output and a new state. The
//! [`map`] driver threads the state through a [`Seq`](crate::seq::Seq), narrowing it whenever
//! sequences end. Backward passes run in reverse, carrying a [`StateGrad`] from each timestep to
//! the one before it.

use crate::{
    autodiff::{Grad, Var, VarSet},
    error::{Error, Result},
    net::Layer,
    serializer::{self, BuildOptions, Codec, Tagged},
    tensor::Tensor,
};

mod bidir;
mod feedback;
mod layer_block;
mod lstm;
mod map;
mod markov;
mod parallel;
mod stack;
mod vanilla;
mod vec_state;

pub use crate::seq::PresentMap;
pub use bidir::Bidir;
pub use feedback::Feedback;
pub use layer_block::LayerBlock;
pub use lstm::{Lstm, LstmGate};
pub use map::{map, map_with_start};
pub use markov::Markov;
pub use parallel::Parallel;
pub use stack::Stack;
pub use vanilla::Vanilla;
pub use vec_state::VecState;

/// The memory a block carries between timesteps.
#[derive(Clone, Debug, PartialEq)]
pub enum State {
    /// No memory, only the set of running sequences.
    Empty(PresentMap),
    /// One vector per sequence.
    Vec(VecState),
    /// Output and cell state of an LSTM.
    Lstm {
        /// Output of the previous timestep.
        last_out: VecState,
        /// Internal cell state.
        internal: VecState,
    },
    /// One state per stacked block.
    Stack(Vec<State>),
    /// States of two blocks run side by side.
    Parallel(Box<State>, Box<State>),
    /// State of a feedback block.
    Feedback {
        /// State of the wrapped block.
        block: Box<State>,
        /// Output of the previous timestep.
        last_out: VecState,
    },
}

/// The gradient of a [`State`], shaped like it.
#[derive(Clone, Debug, PartialEq)]
pub enum StateGrad {
    /// Gradient of [`State::Empty`].
    Empty(PresentMap),
    /// Gradient of [`State::Vec`].
    Vec(VecState),
    /// Gradient of [`State::Lstm`].
    Lstm {
        /// Gradient of the previous output.
        last_out: VecState,
        /// Gradient of the cell state.
        internal: VecState,
    },
    /// Gradient of [`State::Stack`].
    Stack(Vec<StateGrad>),
    /// Gradient of [`State::Parallel`].
    Parallel(Box<StateGrad>, Box<StateGrad>),
    /// Gradient of [`State::Feedback`].
    Feedback {
        /// Gradient of the wrapped block's state.
        block: Box<StateGrad>,
        /// Gradient of the previous output.
        last_out: VecState,
    },
}

impl State {
    /// Return the sequences this state covers.
    pub fn present(&self) -> &PresentMap {
        match self {
            State::Empty(p) => p,
            State::Vec(v) => &v.present,
            State::Lstm { last_out, .. } => &last_out.present,
            State::Stack(states) => states
                .first()
                .map(State::present)
                .unwrap_or_else(|| panic!("empty stack state")),
            State::Parallel(s1, _) => s1.present(),
            State::Feedback { block, .. } => block.present(),
        }
    }

    /// Keep only the sequences in `present`.
    ///
    /// # Panics
    ///
    /// Panics unless `present` is a subset of [`State::present`].
    pub fn reduce(&self, present: &PresentMap) -> State {
        match self {
            State::Empty(p) => {
                assert!(
                    present.is_subset_of(p),
                    "argument to reduce must be a subset"
                );
                State::Empty(present.clone())
            }
            State::Vec(v) => State::Vec(v.reduce(present)),
            State::Lstm { last_out, internal } => State::Lstm {
                last_out: last_out.reduce(present),
                internal: internal.reduce(present),
            },
            State::Stack(states) => State::Stack(states.iter().map(|s| s.reduce(present)).collect()),
            State::Parallel(s1, s2) => {
                State::Parallel(Box::new(s1.reduce(present)), Box::new(s2.reduce(present)))
            }
            State::Feedback { block, last_out } => State::Feedback {
                block: Box::new(block.reduce(present)),
                last_out: last_out.reduce(present),
            },
        }
    }

    pub(crate) fn expect_vec(&self) -> &VecState {
        match self {
            State::Vec(v) => v,
            other => panic!("expected a vector state, got {}", other.kind()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            State::Empty(_) => "an empty state",
            State::Vec(_) => "a vector state",
            State::Lstm { .. } => "an LSTM state",
            State::Stack(_) => "a stack state",
            State::Parallel(..) => "a parallel state",
            State::Feedback { .. } => "a feedback state",
        }
    }
}

impl StateGrad {
    /// Return the sequences this gradient covers.
    pub fn present(&self) -> &PresentMap {
        match self {
            StateGrad::Empty(p) => p,
            StateGrad::Vec(v) => &v.present,
            StateGrad::Lstm { last_out, .. } => &last_out.present,
            StateGrad::Stack(grads) => grads
                .first()
                .map(StateGrad::present)
                .unwrap_or_else(|| panic!("empty stack state gradient")),
            StateGrad::Parallel(g1, _) => g1.present(),
            StateGrad::Feedback { block, .. } => block.present(),
        }
    }

    /// Widen to the sequences in `present`, with zero gradients for the new ones.
    ///
    /// # Panics
    ///
    /// Panics unless `present` is a superset of [`StateGrad::present`].
    pub fn expand(&self, present: &PresentMap) -> StateGrad {
        match self {
            StateGrad::Empty(p) => {
                assert!(
                    p.is_subset_of(present),
                    "argument to expand must be a superset"
                );
                StateGrad::Empty(present.clone())
            }
            StateGrad::Vec(v) => StateGrad::Vec(v.expand(present)),
            StateGrad::Lstm { last_out, internal } => StateGrad::Lstm {
                last_out: last_out.expand(present),
                internal: internal.expand(present),
            },
            StateGrad::Stack(grads) => {
                StateGrad::Stack(grads.iter().map(|g| g.expand(present)).collect())
            }
            StateGrad::Parallel(g1, g2) => {
                StateGrad::Parallel(Box::new(g1.expand(present)), Box::new(g2.expand(present)))
            }
            StateGrad::Feedback { block, last_out } => StateGrad::Feedback {
                block: Box::new(block.expand(present)),
                last_out: last_out.expand(present),
            },
        }
    }

    fn into_vec(self) -> VecState {
        match self {
            StateGrad::Vec(v) => v,
            _ => panic!("expected a vector state gradient"),
        }
    }
}

/// The result of running a block for one timestep.
pub trait StepRes {
    /// Return the state to pass to the next timestep.
    fn state(&self) -> &State;

    /// Return the packed outputs of the present sequences.
    fn output(&self) -> &Tensor;

    /// Return every variable the output and state depend on.
    fn vars(&self) -> &VarSet;

    /// Propagate an output gradient and, unless this is the last timestep, the gradient of the
    /// next timestep's state. Returns the gradients of the input and of the incoming state.
    fn propagate(
        &self,
        upstream: Tensor,
        state_upstream: Option<StateGrad>,
        grad: &mut Grad,
    ) -> (Tensor, StateGrad);
}

/// A recurrent building block.
#[derive(Clone, Debug)]
pub enum Block {
    /// A stateless feed-forward layer.
    Layer(LayerBlock),
    /// A vanilla recurrent layer.
    Vanilla(Vanilla),
    /// A long short-term memory layer.
    Lstm(Box<Lstm>),
    /// Blocks applied in sequence.
    Stack(Stack),
    /// Two blocks whose outputs are mixed.
    Parallel(Box<Parallel>),
    /// A block which sees its previous output.
    Feedback(Box<Feedback>),
    /// A block emitting its input together with a window of earlier inputs.
    Markov(Markov),
}

impl From<LayerBlock> for Block {
    fn from(b: LayerBlock) -> Self {
        Block::Layer(b)
    }
}

impl From<Vanilla> for Block {
    fn from(b: Vanilla) -> Self {
        Block::Vanilla(b)
    }
}

impl From<Lstm> for Block {
    fn from(b: Lstm) -> Self {
        Block::Lstm(Box::new(b))
    }
}

impl From<Stack> for Block {
    fn from(b: Stack) -> Self {
        Block::Stack(b)
    }
}

impl From<Parallel> for Block {
    fn from(b: Parallel) -> Self {
        Block::Parallel(Box::new(b))
    }
}

impl From<Feedback> for Block {
    fn from(b: Feedback) -> Self {
        Block::Feedback(Box::new(b))
    }
}

impl From<Markov> for Block {
    fn from(b: Markov) -> Self {
        Block::Markov(b)
    }
}

impl Block {
    /// Create the initial state for `n` sequences.
    pub fn start(&self, n: usize) -> State {
        match self {
            Block::Layer(b) => b.start(n),
            Block::Vanilla(b) => b.start(n),
            Block::Lstm(b) => b.start(n),
            Block::Stack(b) => b.start(n),
            Block::Parallel(b) => b.start(n),
            Block::Feedback(b) => b.start(n),
            Block::Markov(b) => b.start(n),
        }
    }

    /// Propagate the gradient of a state created by [`Block::start`].
    pub fn propagate_start(&self, state_grad: StateGrad, grad: &mut Grad) {
        match self {
            Block::Layer(_) => {}
            Block::Vanilla(b) => b.propagate_start(state_grad, grad),
            Block::Lstm(b) => b.propagate_start(state_grad, grad),
            Block::Stack(b) => b.propagate_start(state_grad, grad),
            Block::Parallel(b) => b.propagate_start(state_grad, grad),
            Block::Feedback(b) => b.propagate_start(state_grad, grad),
            Block::Markov(b) => b.propagate_start(state_grad, grad),
        }
    }

    /// Run one timestep on the packed inputs of the present sequences.
    pub fn step(&self, state: &State, input: &Tensor) -> Box<dyn StepRes> {
        match self {
            Block::Layer(b) => b.step(state, input),
            Block::Vanilla(b) => b.step(state, input),
            Block::Lstm(b) => b.step(state, input),
            Block::Stack(b) => b.step(state, input),
            Block::Parallel(b) => b.step(state, input),
            Block::Feedback(b) => b.step(state, input),
            Block::Markov(b) => b.step(state, input),
        }
    }

    /// Return the trainable variables.
    pub fn parameters(&self) -> Vec<Var> {
        match self {
            Block::Layer(b) => b.layer.parameters(),
            Block::Vanilla(b) => b.parameters(),
            Block::Lstm(b) => b.parameters(),
            Block::Stack(b) => b.parameters(),
            Block::Parallel(b) => b.parameters(),
            Block::Feedback(b) => b.parameters(),
            Block::Markov(b) => b.parameters(),
        }
    }

    /// Return the type identifier written when serializing.
    pub fn type_id(&self) -> &'static str {
        match self {
            Block::Layer(_) => LayerBlock::TYPE_ID,
            Block::Vanilla(_) => Vanilla::TYPE_ID,
            Block::Lstm(_) => Lstm::TYPE_ID,
            Block::Stack(_) => Stack::TYPE_ID,
            Block::Parallel(_) => Parallel::TYPE_ID,
            Block::Feedback(_) => Feedback::TYPE_ID,
            Block::Markov(_) => Markov::TYPE_ID,
        }
    }

    /// Encode the block with its type identifier.
    pub fn to_tagged(&self) -> Result<Tagged> {
        match self {
            Block::Layer(b) => Tagged::new(b),
            Block::Vanilla(b) => Tagged::new(b),
            Block::Lstm(b) => Tagged::new(b.as_ref()),
            Block::Stack(b) => Tagged::new(b),
            Block::Parallel(b) => Tagged::new(b.as_ref()),
            Block::Feedback(b) => Tagged::new(b.as_ref()),
            Block::Markov(b) => Tagged::new(b),
        }
    }

    /// Decode a tagged record of any block kind.
    pub fn from_tagged(t: &Tagged, opts: &BuildOptions) -> Result<Self> {
        let block = match t.type_id.as_str() {
            id if id == LayerBlock::TYPE_ID => Block::Layer(t.decode(opts)?),
            id if id == Vanilla::TYPE_ID => Block::Vanilla(t.decode(opts)?),
            id if id == Lstm::TYPE_ID => Block::Lstm(Box::new(t.decode(opts)?)),
            id if id == Stack::TYPE_ID => Block::Stack(t.decode(opts)?),
            id if id == Parallel::TYPE_ID => Block::Parallel(Box::new(t.decode(opts)?)),
            id if id == Feedback::TYPE_ID => Block::Feedback(Box::new(t.decode(opts)?)),
            id if id == Markov::TYPE_ID => Block::Markov(t.decode(opts)?),
            other => return Err(Error::UnknownType(other.to_owned())),
        };
        Ok(block)
    }

    /// Serialize the block as a standalone tagged record.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serializer::to_bytes(&self.to_tagged()?)
    }

    /// Deserialize a block of any kind, rejecting trailing data.
    pub fn deserialize(data: &[u8], opts: &BuildOptions) -> Result<Self> {
        Self::from_tagged(&serializer::from_bytes(data)?, opts)
    }
}

impl From<Layer> for Block {
    fn from(layer: Layer) -> Self {
        Block::Layer(LayerBlock { layer })
    }
}

/// Take a temporary accumulator out of `grad`, or zeros if nothing reached it.
fn take_pool(grad: &mut Grad, pool: &Var) -> Tensor {
    grad.remove(pool.id())
        .unwrap_or_else(|| Tensor::zeros(pool.len()))
}
