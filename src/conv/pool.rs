use std::{cell::OnceCell, rc::Rc};

use serde::{Deserialize, Serialize};

use super::im2row::out_count;
use crate::{
    autodiff::{Grad, Res, ResRef, VarSet},
    error::{Error, Result},
    serializer::{BuildOptions, Codec},
    tensor::{Mapper, Tensor},
};

/// Takes the maximum over non-overlapping `span_x x span_y` windows of each depth slice.
///
/// Windows that would extend past the input edge are dropped.
#[derive(Clone, Debug)]
pub struct MaxPool {
    /// Window width.
    pub span_x: usize,
    /// Window height.
    pub span_y: usize,
    /// Input width.
    pub input_width: usize,
    /// Input height.
    pub input_height: usize,
    /// Input depth.
    pub input_depth: usize,
    windows: OnceCell<Rc<Mapper>>,
}

impl PartialEq for MaxPool {
    fn eq(&self, other: &Self) -> bool {
        self.dims() == other.dims()
    }
}

impl MaxPool {
    /// Describe a pooling layer.
    pub fn new(span: (usize, usize), input: (usize, usize, usize)) -> Self {
        assert!(span.0 > 0 && span.1 > 0, "pooling span must be positive");
        Self {
            span_x: span.0,
            span_y: span.1,
            input_width: input.0,
            input_height: input.1,
            input_depth: input.2,
            windows: OnceCell::new(),
        }
    }

    fn dims(&self) -> [usize; 5] {
        [
            self.span_x,
            self.span_y,
            self.input_width,
            self.input_height,
            self.input_depth,
        ]
    }

    /// Output width.
    pub fn output_width(&self) -> usize {
        out_count(self.input_width, self.span_x, self.span_x)
    }

    /// Output height.
    pub fn output_height(&self) -> usize {
        out_count(self.input_height, self.span_y, self.span_y)
    }

    /// Gather table listing, for each output entry, the `span_x * span_y` inputs it pools.
    fn windows(&self) -> Rc<Mapper> {
        Rc::clone(self.windows.get_or_init(|| {
            let (w, d) = (self.input_width, self.input_depth);
            let mut table = Vec::new();
            for oy in 0..self.output_height() {
                for ox in 0..self.output_width() {
                    for z in 0..d {
                        for sy in 0..self.span_y {
                            for sx in 0..self.span_x {
                                let (x, y) = (ox * self.span_x + sx, oy * self.span_y + sy);
                                table.push((y * w + x) * d + z);
                            }
                        }
                    }
                }
            }
            Rc::new(Mapper::new(w * self.input_height * d, table))
        }))
    }

    /// Apply the layer to `batch` images.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        let in_size = self.input_width * self.input_height * self.input_depth;
        assert_eq!(input.output().len(), batch * in_size, "incorrect max-pool input size");
        let windows = self.windows();
        let span = self.span_x * self.span_y;
        let table = windows.table();
        let x = input.output().data();

        let mut sources = Vec::with_capacity(batch * table.len() / span);
        for i in 0..batch {
            let offset = i * in_size;
            for window in table.chunks(span) {
                let best = window
                    .iter()
                    .map(|&j| offset + j)
                    .reduce(|a, b| if x[b] > x[a] { b } else { a });
                if let Some(best) = best {
                    sources.push(best);
                }
            }
        }
        let out = sources.iter().map(|&j| x[j]).collect();
        Rc::new(GatherRes {
            input,
            sources,
            out,
        })
    }
}

/// Gathers input entries; the backward pass scatters them back.
struct GatherRes {
    input: ResRef,
    sources: Vec<usize>,
    out: Tensor,
}

impl Res for GatherRes {
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
        let mut down = Tensor::zeros(self.input.output().len());
        for (&j, u) in self.sources.iter().zip(upstream.data()) {
            down[j] += u;
        }
        self.input.propagate(down, grad);
    }
}

/// Window and input dimensions shared by both pooling layers.
#[derive(Serialize, Deserialize)]
pub struct PoolRecord {
    span_x: usize,
    span_y: usize,
    input_width: usize,
    input_height: usize,
    input_depth: usize,
}

impl PoolRecord {
    fn from_dims([span_x, span_y, input_width, input_height, input_depth]: [usize; 5]) -> Self {
        Self {
            span_x,
            span_y,
            input_width,
            input_height,
            input_depth,
        }
    }

    fn validate(self) -> Result<((usize, usize), (usize, usize, usize))> {
        if self.span_x == 0 || self.span_y == 0 {
            return Err(Error::InvalidData("zero pooling span".into()));
        }
        Ok((
            (self.span_x, self.span_y),
            (self.input_width, self.input_height, self.input_depth),
        ))
    }
}

impl Codec for MaxPool {
    const TYPE_ID: &'static str = "anynet.conv.MaxPool";
    type Record = PoolRecord;

    fn to_record(&self) -> Result<PoolRecord> {
        Ok(PoolRecord::from_dims(self.dims()))
    }

    fn from_record(r: PoolRecord, _: &BuildOptions) -> Result<Self> {
        let (span, input) = r.validate()?;
        Ok(Self::new(span, input))
    }
}

/// Averages over non-overlapping `span_x x span_y` windows of each depth slice.
///
/// Incomplete windows at the right and bottom edges are kept: missing entries count as zero and
/// the sum is still divided by the full window area.
#[derive(Clone, Debug)]
pub struct MeanPool {
    /// Window width.
    pub span_x: usize,
    /// Window height.
    pub span_y: usize,
    /// Input width.
    pub input_width: usize,
    /// Input height.
    pub input_height: usize,
    /// Input depth.
    pub input_depth: usize,
    mapping: OnceCell<Rc<Mapper>>,
}

impl PartialEq for MeanPool {
    fn eq(&self, other: &Self) -> bool {
        self.dims() == other.dims()
    }
}

impl MeanPool {
    /// Describe a pooling layer.
    pub fn new(span: (usize, usize), input: (usize, usize, usize)) -> Self {
        assert!(span.0 > 0 && span.1 > 0, "pooling span must be positive");
        Self {
            span_x: span.0,
            span_y: span.1,
            input_width: input.0,
            input_height: input.1,
            input_depth: input.2,
            mapping: OnceCell::new(),
        }
    }

    fn dims(&self) -> [usize; 5] {
        [
            self.span_x,
            self.span_y,
            self.input_width,
            self.input_height,
            self.input_depth,
        ]
    }

    /// Output width.
    pub fn output_width(&self) -> usize {
        self.input_width.div_ceil(self.span_x)
    }

    /// Output height.
    pub fn output_height(&self) -> usize {
        self.input_height.div_ceil(self.span_y)
    }

    /// Gather from an output image to an input image: input entry `k` is pooled into output
    /// `table[k]`.
    fn mapping(&self) -> Rc<Mapper> {
        Rc::clone(self.mapping.get_or_init(|| {
            let d = self.input_depth;
            let out_w = self.output_width();
            let mut table = Vec::with_capacity(self.input_width * self.input_height * d);
            for y in 0..self.input_height {
                for x in 0..self.input_width {
                    let out_idx = ((y / self.span_y) * out_w + x / self.span_x) * d;
                    table.extend(out_idx..out_idx + d);
                }
            }
            Rc::new(Mapper::new(out_w * self.output_height() * d, table))
        }))
    }

    /// Apply the layer to `batch` images.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        let in_size = self.input_width * self.input_height * self.input_depth;
        assert_eq!(input.output().len(), batch * in_size, "incorrect mean-pool input size");
        let mapping = self.mapping();
        let scale = 1.0 / (self.span_x * self.span_y) as f64;
        let mut out = mapping.batch_map_transpose(input.output());
        out.scale(scale);
        Rc::new(MeanPoolRes {
            input,
            mapping,
            scale,
            out,
        })
    }
}

struct MeanPoolRes {
    input: ResRef,
    mapping: Rc<Mapper>,
    scale: f64,
    out: Tensor,
}

impl Res for MeanPoolRes {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        self.input.vars()
    }

    fn propagate(&self, mut upstream: Tensor, grad: &mut Grad) {
        if !grad.intersects(self.input.vars()) {
            return;
        }
        upstream.scale(self.scale);
        self.input.propagate(self.mapping.batch_map(&upstream), grad);
    }
}

impl Codec for MeanPool {
    const TYPE_ID: &'static str = "anynet.conv.MeanPool";
    type Record = PoolRecord;

    fn to_record(&self) -> Result<PoolRecord> {
        Ok(PoolRecord::from_dims(self.dims()))
    }

    fn from_record(r: PoolRecord, _: &BuildOptions) -> Result<Self> {
        let (span, input) = r.validate()?;
        Ok(Self::new(span, input))
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::autodiff::{check::ResChecker, Var};

    fn naive_max_pool(p: &MaxPool, image: &[f64]) -> Vec<f64> {
        let (w, d) = (p.input_width, p.input_depth);
        let mut out = Vec::new();
        for oy in 0..p.output_height() {
            for ox in 0..p.output_width() {
                for z in 0..d {
                    let mut best = f64::NEG_INFINITY;
                    for y in oy * p.span_y..(oy + 1) * p.span_y {
                        for x in ox * p.span_x..(ox + 1) * p.span_x {
                            best = best.max(image[(y * w + x) * d + z]);
                        }
                    }
                    out.push(best);
                }
            }
        }
        out
    }

    #[test]
    fn max_pool_matches_naive() {
        let mut rng = StdRng::seed_from_u64(7);
        let p = MaxPool::new((2, 3), (7, 8, 3));
        assert_eq!((p.output_width(), p.output_height()), (3, 2));
        let input = Tensor::rand_normal(2 * 7 * 8 * 3, 1.0, &mut rng);
        let out = p.apply(constant_of(&input), 2);
        let half = 7 * 8 * 3;
        let mut expected = naive_max_pool(&p, &input.data()[..half]);
        expected.extend(naive_max_pool(&p, &input.data()[half..]));
        assert_eq!(out.output().data(), expected.as_slice());
    }

    #[test]
    fn max_pool_routes_gradient_to_maximum() {
        let p = MaxPool::new((2, 2), (2, 2, 1));
        let v = Var::new(Tensor::from(vec![1.0, 5.0, -2.0, 3.0]));
        let out = p.apply(v.res(), 1);
        assert_eq!(out.output().data(), &[5.0]);
        let mut g = Grad::zeros([&v]);
        out.propagate(Tensor::from(vec![2.0]), &mut g);
        assert_eq!(g.get(v.id()).map(Tensor::data), Some(&[0.0, 2.0, 0.0, 0.0][..]));
    }

    #[test]
    fn mean_pool_keeps_partial_windows() {
        let p = MeanPool::new((2, 2), (3, 2, 1));
        assert_eq!((p.output_width(), p.output_height()), (2, 1));
        let input = Tensor::from(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = p.apply(constant_of(&input), 1);
        assert_eq!(out.output().data(), &[3.0, 2.25]);
    }

    #[test]
    fn mean_pool_gradients() {
        let mut rng = StdRng::seed_from_u64(3);
        let p = MeanPool::new((2, 3), (5, 4, 2));
        let v = Var::new(Tensor::rand_normal(2 * 5 * 4 * 2, 1.0, &mut rng));
        ResChecker::new(|| p.apply(v.res(), 2), vec![v.clone()]).assert_gradients();
    }

    fn constant_of(t: &Tensor) -> ResRef {
        crate::autodiff::constant(t.clone())
    }
}
