//! Index tables gathering or scattering tensor entries.

use super::Tensor;

/// A fixed gather table from an input of `in_size` entries to an output of `table.len()` entries.
///
/// Mapping copies `input[table[i]]` to `output[i]`; the transpose scatters and adds the other way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapper {
    in_size: usize,
    table: Vec<usize>,
}

impl Mapper {
    /// Create a mapper, checking that every index is in bounds.
    pub fn new(in_size: usize, table: Vec<usize>) -> Self {
        assert!(
            table.iter().all(|&i| i < in_size),
            "mapper index out of bounds for input size {in_size}"
        );
        Self { in_size, table }
    }

    /// Return the expected input length.
    pub fn in_size(&self) -> usize {
        self.in_size
    }

    /// Return the produced output length.
    pub fn out_size(&self) -> usize {
        self.table.len()
    }

    /// Return the gather table.
    pub fn table(&self) -> &[usize] {
        &self.table
    }

    /// Gather one input.
    pub fn map(&self, input: &[f64]) -> Tensor {
        assert_eq!(input.len(), self.in_size, "bad mapper input size");
        self.table.iter().map(|&i| input[i]).collect()
    }

    /// Scatter-add one output-sized tensor into an input-sized buffer.
    pub fn map_transpose(&self, input: &[f64], out: &mut [f64]) {
        assert_eq!(input.len(), self.table.len(), "bad mapper transpose input size");
        assert_eq!(out.len(), self.in_size, "bad mapper transpose output size");
        for (&i, x) in self.table.iter().zip(input) {
            out[i] += x;
        }
    }

    /// Gather every input of a packed batch.
    pub fn batch_map(&self, input: &Tensor) -> Tensor {
        if self.in_size == 0 {
            return Tensor::zeros(0);
        }
        assert_eq!(input.len() % self.in_size, 0, "bad mapper batch input size");
        let mut out = Vec::with_capacity(input.len() / self.in_size * self.out_size());
        for chunk in input.data().chunks(self.in_size) {
            out.extend(self.table.iter().map(|&i| chunk[i]));
        }
        Tensor::from_vec(out)
    }

    /// Scatter-add every output of a packed batch into a fresh input-sized batch.
    pub fn batch_map_transpose(&self, input: &Tensor) -> Tensor {
        if self.table.is_empty() {
            return Tensor::zeros(0);
        }
        assert_eq!(input.len() % self.out_size(), 0, "bad mapper batch transpose size");
        let n = input.len() / self.out_size();
        let mut out = Tensor::zeros(n * self.in_size);
        for (src, dst) in input
            .data()
            .chunks(self.out_size())
            .zip(out.data_mut().chunks_mut(self.in_size))
        {
            self.map_transpose(src, dst);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_and_scatter() {
        let m = Mapper::new(3, vec![2, 0, 2]);
        assert_eq!(m.map(&[1.0, 2.0, 3.0]).data(), &[3.0, 1.0, 3.0]);
        let mut out = [0.0; 3];
        m.map_transpose(&[1.0, 2.0, 3.0], &mut out);
        assert_eq!(out, [2.0, 0.0, 4.0]);

        let batch = Tensor::from(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(m.batch_map(&batch).data(), &[3.0, 1.0, 3.0, 6.0, 4.0, 6.0]);
        let back = m.batch_map_transpose(&Tensor::from(vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]));
        assert_eq!(back.data(), &[1.0, 0.0, 2.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn rejects_bad_table() {
        Mapper::new(2, vec![0, 2]);
    }
}
