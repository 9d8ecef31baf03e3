use crate::{
    autodiff::{Grad, Var},
    seq::PresentMap,
    tensor::Tensor,
};

/// A state or state gradient made of one equal-length vector per present sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct VecState {
    /// Vectors of the present sequences, concatenated.
    pub vector: Tensor,
    /// Which sequences are present.
    pub present: PresentMap,
}

impl VecState {
    /// Repeat `vector` once for each of `n` sequences, all present.
    pub fn start(vector: &Tensor, n: usize) -> Self {
        Self {
            vector: Tensor::concat(std::iter::repeat(vector).take(n)),
            present: PresentMap::all(n),
        }
    }

    fn chunk_size(&self) -> usize {
        match self.present.num_present() {
            0 => 0,
            n => self.vector.len() / n,
        }
    }

    /// Drop the vectors of sequences missing from `present`.
    ///
    /// # Panics
    ///
    /// Panics unless `present` is a subset of the current map.
    pub fn reduce(&self, present: &PresentMap) -> Self {
        assert!(
            present.is_subset_of(&self.present),
            "argument to reduce must be a subset"
        );
        let chunk = self.chunk_size();
        let mut kept = Vec::with_capacity(present.num_present() * chunk);
        let mut offset = 0;
        for (&have, &keep) in self.present.as_slice().iter().zip(present.as_slice()) {
            if have {
                if keep {
                    kept.extend_from_slice(&self.vector.data()[offset..offset + chunk]);
                }
                offset += chunk;
            }
        }
        Self {
            vector: Tensor::from_vec(kept),
            present: present.clone(),
        }
    }

    /// Insert zero vectors for sequences present in `present` but not in the current map.
    ///
    /// # Panics
    ///
    /// Panics unless `present` is a superset of the current map.
    pub fn expand(&self, present: &PresentMap) -> Self {
        assert!(
            self.present.is_subset_of(present),
            "argument to expand must be a superset"
        );
        let chunk = self.chunk_size();
        let mut out = Vec::with_capacity(present.num_present() * chunk);
        let mut offset = 0;
        for (&have, &want) in self.present.as_slice().iter().zip(present.as_slice()) {
            if have {
                out.extend_from_slice(&self.vector.data()[offset..offset + chunk]);
                offset += chunk;
            } else if want {
                out.resize(out.len() + chunk, 0.0);
            }
        }
        Self {
            vector: Tensor::from_vec(out),
            present: present.clone(),
        }
    }

    /// Treat `self` as the gradient of a state built by [`VecState::start`] from `var`, and add
    /// the sum over sequences to `var`'s accumulator.
    pub fn propagate_start(&self, var: &Var, grad: &mut Grad) {
        if grad.contains(var.id()) {
            grad.accumulate(var.id(), &self.vector.sum_rows(var.len()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(flags: &str) -> PresentMap {
        PresentMap::new(flags.chars().map(|c| c == 'T').collect())
    }

    fn state(n: usize, flags: &str) -> VecState {
        VecState {
            vector: (1..=n).map(|i| i as f64).collect(),
            present: map(flags),
        }
    }

    #[test]
    fn reduce() {
        let s = state(10, "TFTTFFTT");
        assert_eq!(
            s.reduce(&map("TFFTFFFT")).vector.data(),
            &[1.0, 2.0, 5.0, 6.0, 9.0, 10.0]
        );
        assert_eq!(s.reduce(&map("FFTFFFTF")).vector.data(), &[3.0, 4.0, 7.0, 8.0]);
    }

    #[test]
    fn expand() {
        let s = state(6, "TFTFFFFT");
        let cases: [(&str, &[f64]); 3] = [
            (
                "TFTFTFTT",
                &[1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0, 5.0, 6.0],
            ),
            (
                "TTTTTTTT",
                &[
                    1.0, 2.0, 0.0, 0.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0,
                    6.0,
                ],
            ),
            (
                "TFTFTTTT",
                &[1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0, 6.0],
            ),
        ];
        for (flags, expected) in cases {
            let e = s.expand(&map(flags));
            assert_eq!(e.vector.data(), expected, "expanding to {flags}");
            assert_eq!(e.present, map(flags));
        }
    }

    #[test]
    #[should_panic(expected = "argument to reduce must be a subset")]
    fn reduce_rejects_superset() {
        state(4, "TFTF").reduce(&map("TTTF"));
    }

    #[test]
    #[should_panic(expected = "argument to expand must be a superset")]
    fn expand_rejects_subset() {
        state(4, "TFTF").expand(&map("TFFF"));
    }

    #[test]
    fn start_and_propagate() {
        let var = Var::new(Tensor::from(vec![1.0, 2.0]));
        let s = VecState::start(&var.value(), 3);
        assert_eq!(s.vector.data(), &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert_eq!(s.present.num_present(), 3);

        let mut grad = Grad::zeros([&var]);
        let upstream = VecState {
            vector: Tensor::from(vec![1.0, 0.5, 2.0, 0.25, -1.0, 1.0]),
            present: PresentMap::all(3),
        };
        upstream.propagate_start(&var, &mut grad);
        assert_eq!(grad.get(var.id()).unwrap().data(), &[2.0, 1.75]);
    }
}
