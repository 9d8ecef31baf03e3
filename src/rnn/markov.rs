use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{Grad, Var, VarSet},
    error::{Error, Result},
    serializer::{BuildOptions, Codec},
    tensor::Tensor,
};

use super::{State, StateGrad, StepRes, VecState};

/// A block whose output is its input followed by the inputs of the previous `history_size`
/// timesteps, most recent first.
///
/// Before enough timesteps have passed, the missing history comes from `start_state`.
#[derive(Clone, Debug)]
pub struct Markov {
    /// Learnable history seen by the first timestep, `history_size` input vectors long.
    pub start_state: Var,
    /// Number of earlier inputs to remember.
    pub history_size: usize,
    /// Interleave the remembered inputs component by component instead of concatenating them.
    ///
    /// With inputs `a` (current) and `b` (previous), the output is `<a1, b1, a2, b2, ...>`
    /// rather than `<a1, a2, ..., b1, b2, ...>`.
    pub depth_wise: bool,
}

impl Markov {
    /// Create a block with a zero start state.
    ///
    /// # Panics
    ///
    /// Panics if `history_size` or `in_size` is zero.
    pub fn new(history_size: usize, in_size: usize) -> Self {
        assert!(
            history_size > 0 && in_size > 0,
            "input and history sizes must be non-zero"
        );
        Self {
            start_state: Var::new(Tensor::zeros(history_size * in_size)),
            history_size,
            depth_wise: false,
        }
    }

    fn in_size(&self) -> usize {
        self.start_state.len() / self.history_size
    }

    pub(super) fn start(&self, n: usize) -> State {
        State::Vec(VecState::start(&self.start_state.value(), n))
    }

    pub(super) fn propagate_start(&self, state_grad: StateGrad, grad: &mut Grad) {
        state_grad.into_vec().propagate_start(&self.start_state, grad);
    }

    pub(super) fn step(&self, state: &State, input: &Tensor) -> Box<dyn StepRes> {
        let history = state.expect_vec();
        let d = self.in_size();
        let rows = self.history_size + 1;
        let n = history.present.num_present();
        assert_eq!(input.len(), n * d, "input size must be {d} per sequence");

        let mut output = Vec::with_capacity(n * rows * d);
        let mut new_state = Vec::with_capacity(n * self.history_size * d);
        for i in 0..n {
            let mut joined = Vec::with_capacity(rows * d);
            joined.extend_from_slice(&input.data()[i * d..(i + 1) * d]);
            let old = (rows - 1) * d;
            joined.extend_from_slice(&history.vector.data()[i * old..(i + 1) * old]);
            new_state.extend_from_slice(&joined[..old]);
            if self.depth_wise {
                output.extend(transpose(&joined, rows, d));
            } else {
                output.extend(joined);
            }
        }

        Box::new(MarkovRes {
            state: State::Vec(VecState {
                vector: Tensor::from_vec(new_state),
                present: history.present.clone(),
            }),
            output: Tensor::from_vec(output),
            vars: self.parameters().iter().collect(),
            in_size: d,
            history_size: self.history_size,
            depth_wise: self.depth_wise,
        })
    }

    /// Return the start state.
    pub fn parameters(&self) -> Vec<Var> {
        vec![self.start_state.clone()]
    }
}

/// Transpose a row-major `rows x cols` matrix.
fn transpose(data: &[f64], rows: usize, cols: usize) -> Vec<f64> {
    let mut out = vec![0.0; data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

struct MarkovRes {
    state: State,
    output: Tensor,
    vars: VarSet,
    in_size: usize,
    history_size: usize,
    depth_wise: bool,
}

impl StepRes for MarkovRes {
    fn state(&self) -> &State {
        &self.state
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(
        &self,
        upstream: Tensor,
        state_upstream: Option<StateGrad>,
        _: &mut Grad,
    ) -> (Tensor, StateGrad) {
        let d = self.in_size;
        let rows = self.history_size + 1;
        let old = self.history_size * d;
        let state_upstream = state_upstream.map(StateGrad::into_vec);
        let present = self.state.present();

        let mut in_grad = Vec::with_capacity(present.num_present() * d);
        let mut state_grad = Vec::with_capacity(present.num_present() * old);
        for i in 0..present.num_present() {
            let chunk = &upstream.data()[i * rows * d..(i + 1) * rows * d];
            let mut joined = if self.depth_wise {
                transpose(chunk, d, rows)
            } else {
                chunk.to_vec()
            };
            if let Some(s) = &state_upstream {
                for (j, x) in s.vector.data()[i * old..(i + 1) * old].iter().enumerate() {
                    joined[j] += x;
                }
            }
            in_grad.extend_from_slice(&joined[..d]);
            state_grad.extend_from_slice(&joined[d..]);
        }

        (
            Tensor::from_vec(in_grad),
            StateGrad::Vec(VecState {
                vector: Tensor::from_vec(state_grad),
                present: present.clone(),
            }),
        )
    }
}

/// Stored start state and settings of a [`Markov`] block.
#[derive(Serialize, Deserialize)]
pub struct MarkovRecord {
    start_state: Tensor,
    history_size: usize,
    depth_wise: bool,
}

impl Codec for Markov {
    const TYPE_ID: &'static str = "anynet.rnn.Markov";
    type Record = MarkovRecord;

    fn to_record(&self) -> Result<MarkovRecord> {
        Ok(MarkovRecord {
            start_state: Tensor::clone(&self.start_state.value()),
            history_size: self.history_size,
            depth_wise: self.depth_wise,
        })
    }

    fn from_record(r: MarkovRecord, _: &BuildOptions) -> Result<Self> {
        if r.history_size == 0
            || r.start_state.is_empty()
            || r.start_state.len() % r.history_size != 0
        {
            return Err(Error::InvalidData(format!(
                "start state of length {} does not hold {} inputs",
                r.start_state.len(),
                r.history_size
            )));
        }
        Ok(Self {
            start_state: Var::new(r.start_state),
            history_size: r.history_size,
            depth_wise: r.depth_wise,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::PresentMap;

    #[test]
    fn output_holds_current_then_earlier_inputs() {
        let m = Markov::new(2, 2);
        m.start_state.set(Tensor::from(vec![-1.0, -2.0, -3.0, -4.0]));
        let state = m.start(1);
        let s1 = m.step(&state, &Tensor::from(vec![1.0, 2.0]));
        assert_eq!(s1.output().data(), &[1.0, 2.0, -1.0, -2.0, -3.0, -4.0]);
        let s2 = m.step(s1.state(), &Tensor::from(vec![3.0, 4.0]));
        assert_eq!(s2.output().data(), &[3.0, 4.0, 1.0, 2.0, -1.0, -2.0]);
        assert_eq!(s2.state().expect_vec().vector.data(), &[3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn depth_wise_interleaves_components() {
        let mut m = Markov::new(1, 3);
        m.depth_wise = true;
        m.start_state.set(Tensor::from(vec![4.0, 5.0, 6.0]));
        let state = State::Vec(VecState {
            vector: Tensor::from(vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0]),
            present: PresentMap::all(2),
        });
        let s = m.step(&state, &Tensor::from(vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]));
        assert_eq!(
            s.output().data(),
            &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0, 0.0, 7.0, 0.0, 8.0, 0.0, 9.0]
        );
        let (in_grad, state_grad) = s.propagate(
            Tensor::from(vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            None,
            &mut Grad::new(),
        );
        assert_eq!(in_grad.data(), &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        assert_eq!(
            state_grad.into_vec().vector.data(),
            &[10.0, 20.0, 30.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn rejects_mismatched_start_state() {
        let r = MarkovRecord {
            start_state: Tensor::zeros(5),
            history_size: 2,
            depth_wise: false,
        };
        assert!(Markov::from_record(r, &BuildOptions::default()).is_err());
    }
}
