use std::{cell::OnceCell, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{constant, Grad, Res, ResRef, VarSet},
    error::{Error, Result},
    serializer::{BuildOptions, Codec},
    tensor::{Mapper, Tensor},
};

/// Resizes images with bilinear interpolation.
///
/// Output corners line up with input corners, so both output dimensions must exceed one.
#[derive(Clone, Debug)]
pub struct Resize {
    /// Image depth.
    pub depth: usize,
    /// Input width.
    pub input_width: usize,
    /// Input height.
    pub input_height: usize,
    /// Output width.
    pub output_width: usize,
    /// Output height.
    pub output_height: usize,
    neighbors: OnceCell<Rc<Neighbors>>,
}

/// For every output entry, four source entries and their interpolation weights.
#[derive(Debug)]
struct Neighbors {
    mapper: Mapper,
    weights: Tensor,
}

impl Resize {
    /// Describe a resize from `(width, height)` to `(width, height)` at a given depth.
    pub fn new(depth: usize, input: (usize, usize), output: (usize, usize)) -> Self {
        Self {
            depth,
            input_width: input.0,
            input_height: input.1,
            output_width: output.0,
            output_height: output.1,
            neighbors: OnceCell::new(),
        }
    }

    /// Apply the layer to `batch` images.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        if batch == 0 {
            return constant(Tensor::zeros(0));
        }
        assert!(
            self.input_width > 0
                && self.input_height > 0
                && self.output_width > 1
                && self.output_height > 1
                && self.depth > 0,
            "tensor dimension out of range"
        );
        assert_eq!(
            input.output().len(),
            batch * self.input_width * self.input_height * self.depth,
            "incorrect resize input size"
        );

        let neighbors = self.neighbors();
        let mut mapped = neighbors.mapper.batch_map(input.output());
        mapped.scale_repeated(&neighbors.weights);
        let out = mapped.sum_cols(4);
        Rc::new(ResizeRes {
            input,
            neighbors,
            out,
        })
    }

    fn neighbors(&self) -> Rc<Neighbors> {
        Rc::clone(self.neighbors.get_or_init(|| {
            let mut sources = Vec::new();
            let mut weights = Vec::new();
            let x_scale = (self.input_width - 1) as f64 / (self.output_width - 1) as f64;
            let y_scale = (self.input_height - 1) as f64 / (self.output_height - 1) as f64;
            for y in 0..self.output_height {
                let sy = y_scale * y as f64;
                for x in 0..self.output_width {
                    let (idx, amounts) = self.corners(x_scale * x as f64, sy);
                    for z in 0..self.depth {
                        sources.extend(idx.iter().map(|i| i + z));
                        weights.extend_from_slice(&amounts);
                    }
                }
            }
            let in_size = self.input_width * self.input_height * self.depth;
            Rc::new(Neighbors {
                mapper: Mapper::new(in_size, sources),
                weights: Tensor::from_vec(weights),
            })
        }))
    }

    /// Source offsets and weights of the four pixels around `(sx, sy)`.
    fn corners(&self, sx: f64, sy: f64) -> ([usize; 4], [f64; 4]) {
        let max_x = (self.input_width - 1) as f64;
        let max_y = (self.input_height - 1) as f64;
        let (sx, sy) = (sx.clamp(0.0, max_x), sy.clamp(0.0, max_y));
        let (x1, y1) = (sx as usize, sy as usize);
        let x2 = (x1 + 1).min(self.input_width - 1);
        let y2 = (y1 + 1).min(self.input_height - 1);

        let x1a = 1.0 - (sx - x1 as f64);
        let y1a = 1.0 - (sy - y1 as f64);
        let index = |x: usize, y: usize| self.depth * (x + self.input_width * y);
        (
            [index(x1, y1), index(x2, y1), index(x1, y2), index(x2, y2)],
            [
                x1a * y1a,
                (1.0 - x1a) * y1a,
                x1a * (1.0 - y1a),
                (1.0 - x1a) * (1.0 - y1a),
            ],
        )
    }
}

struct ResizeRes {
    input: ResRef,
    neighbors: Rc<Neighbors>,
    out: Tensor,
}

impl Res for ResizeRes {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        self.input.vars()
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        if !grad.intersects(self.input.vars()) {
            return;
        }
        let weights = self.neighbors.weights.data();
        let mapped: Tensor = (0..upstream.len() * 4)
            .map(|j| weights[j % weights.len()] * upstream[j / 4])
            .collect();
        self.input
            .propagate(self.neighbors.mapper.batch_map_transpose(&mapped), grad);
    }
}

/// Dimensions of a [`Resize`] layer.
#[derive(Serialize, Deserialize)]
pub struct ResizeRecord {
    depth: usize,
    input_width: usize,
    input_height: usize,
    output_width: usize,
    output_height: usize,
}

impl Codec for Resize {
    const TYPE_ID: &'static str = "anynet.conv.Resize";
    type Record = ResizeRecord;

    fn to_record(&self) -> Result<ResizeRecord> {
        Ok(ResizeRecord {
            depth: self.depth,
            input_width: self.input_width,
            input_height: self.input_height,
            output_width: self.output_width,
            output_height: self.output_height,
        })
    }

    fn from_record(r: ResizeRecord, _: &BuildOptions) -> Result<Self> {
        if r.output_width <= 1 || r.output_height <= 1 {
            return Err(Error::InvalidData(format!(
                "resize output {}x{} must exceed one pixel per side",
                r.output_width, r.output_height
            )));
        }
        Ok(Self::new(
            r.depth,
            (r.input_width, r.input_height),
            (r.output_width, r.output_height),
        ))
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::autodiff::{check::ResChecker, Var};

    #[test]
    fn corners_are_preserved() {
        let r = Resize::new(1, (2, 2), (3, 3));
        let out = r.apply(constant(Tensor::from(vec![0.0, 2.0, 4.0, 6.0])), 1);
        let y = out.output();
        assert_eq!(y.len(), 9);
        for (i, expected) in [(0, 0.0), (2, 2.0), (4, 3.0), (6, 4.0), (8, 6.0)] {
            assert!((y[i] - expected).abs() < 1e-12, "entry {i} is {}", y[i]);
        }
    }

    #[test]
    fn edges_interpolate_each_axis() {
        // Every pixel holds its row index, so output row `y` sits at source row `y / 2`.
        let r = Resize::new(1, (3, 3), (5, 5));
        let rows: Tensor = (0..9).map(|i| (i / 3) as f64).collect();
        let out = r.apply(constant(rows), 1);
        let y = out.output();
        for row in 0..5 {
            for col in 0..5 {
                let v = y[row * 5 + col];
                assert!((v - row as f64 * 0.5).abs() < 1e-12, "({col}, {row}) is {v}");
            }
        }

        let cols: Tensor = (0..9).map(|i| (i % 3) as f64).collect();
        let out = r.apply(constant(cols), 1);
        let y = out.output();
        for row in 0..5 {
            for col in 0..5 {
                let v = y[row * 5 + col];
                assert!((v - col as f64 * 0.5).abs() < 1e-12, "({col}, {row}) is {v}");
            }
        }
    }

    #[test]
    fn empty_batch() {
        let r = Resize::new(2, (3, 3), (5, 5));
        assert!(r.apply(constant(Tensor::zeros(0)), 0).output().is_empty());
    }

    #[test]
    fn gradients() {
        let mut rng = StdRng::seed_from_u64(2);
        let r = Resize::new(2, (3, 4), (5, 2));
        let x = Var::new(Tensor::rand_normal(2 * 3 * 4 * 2, 1.0, &mut rng));
        ResChecker::new(|| r.apply(x.res(), 2), vec![x.clone()]).assert_gradients();
    }
}
