use std::{
    rc::Rc,
    sync::{Mutex, PoisonError},
};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{im2row::out_count, ConvStrategy, Im2Row};
use crate::{
    autodiff::{constant, Grad, Res, ResRef, Var, VarSet},
    error::{Error, Result},
    serializer::{BuildOptions, Codec},
    tensor::{cpu, Mapper, Tensor},
};

/// Dimensions of a convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvShape {
    /// Number of filters, which is also the output depth.
    pub filter_count: usize,
    /// Filter width.
    pub filter_width: usize,
    /// Filter height.
    pub filter_height: usize,
    /// Horizontal stride.
    pub stride_x: usize,
    /// Vertical stride.
    pub stride_y: usize,
    /// Input width.
    pub input_width: usize,
    /// Input height.
    pub input_height: usize,
    /// Input depth.
    pub input_depth: usize,
}

impl ConvShape {
    /// Output width, zero when the filter does not fit.
    pub fn output_width(&self) -> usize {
        out_count(self.input_width, self.filter_width, self.stride_x)
    }

    /// Output height, zero when the filter does not fit.
    pub fn output_height(&self) -> usize {
        out_count(self.input_height, self.filter_height, self.stride_y)
    }

    /// Output depth.
    pub fn output_depth(&self) -> usize {
        self.filter_count
    }

    /// Number of entries of one filter.
    pub fn filter_size(&self) -> usize {
        self.filter_width * self.filter_height * self.input_depth
    }

    /// Number of entries of one input image.
    pub fn input_size(&self) -> usize {
        self.input_width * self.input_height * self.input_depth
    }

    /// Number of entries of one output image.
    pub fn output_size(&self) -> usize {
        self.output_width() * self.output_height() * self.output_depth()
    }
}

/// A 2D convolution over depth-minor images.
///
/// Each output position is the dot product of a filter with the input window under it, plus the
/// filter's bias. Filters are stored row-major as `filter_count x (height * width * depth)`.
#[derive(Clone, Debug)]
pub struct Conv {
    /// Layer dimensions.
    pub shape: ConvShape,
    /// Packed filters.
    pub filters: Var,
    /// One bias per filter.
    pub biases: Var,
    /// How batches are processed.
    pub strategy: ConvStrategy,
    im2row: Im2Row,
}

impl Conv {
    /// Create a layer with zero filters and biases.
    pub fn new(shape: ConvShape, strategy: ConvStrategy) -> Self {
        let filters = Tensor::zeros(shape.filter_count * shape.filter_size());
        Self::with_params(shape, filters, Tensor::zeros(shape.filter_count), strategy)
    }

    /// Create a layer with normal filters scaled by `1/sqrt(filter_size)` and zero biases.
    pub fn new_rand<R: Rng + ?Sized>(shape: ConvShape, strategy: ConvStrategy, rng: &mut R) -> Self {
        let scale = 1.0 / (shape.filter_size() as f64).sqrt();
        let filters = Tensor::rand_normal(shape.filter_count * shape.filter_size(), scale, rng);
        Self::with_params(shape, filters, Tensor::zeros(shape.filter_count), strategy)
    }

    /// Create a layer from existing parameters.
    pub fn with_params(
        shape: ConvShape,
        filters: Tensor,
        biases: Tensor,
        strategy: ConvStrategy,
    ) -> Self {
        assert_eq!(
            filters.len(),
            shape.filter_count * shape.filter_size(),
            "bad filter count"
        );
        assert_eq!(biases.len(), shape.filter_count, "bad bias count");
        let im2row = Im2Row::new(
            (shape.filter_width, shape.filter_height),
            (shape.stride_x, shape.stride_y),
            (shape.input_width, shape.input_height, shape.input_depth),
        );
        Self {
            shape,
            filters: Var::new(filters),
            biases: Var::new(biases),
            strategy,
            im2row,
        }
    }

    /// Apply the convolution to `batch` images.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        let shape = &self.shape;
        if batch == 0 || shape.output_width() == 0 || shape.output_height() == 0 {
            return constant(Tensor::zeros(0));
        }
        assert_eq!(
            input.output().len(),
            batch * shape.input_size(),
            "incorrect conv input size"
        );

        let mapper = self.im2row.mapper();
        let filter_value = self.filters.value();
        let (rows, cols, count) = (self.im2row.rows(), shape.filter_size(), shape.filter_count);
        let in_size = shape.input_size();

        let images = input.output().data();
        let filters = filter_value.data();
        let mapping: &Mapper = &mapper;
        let products = self.strategy.map_items(batch, |i| {
            let patches = mapping.map(&images[i * in_size..(i + 1) * in_size]);
            let mut out = vec![0.0; rows * count];
            cpu::gemm(false, true, rows, count, cols, 1.0, patches.data(), filters, 0.0, &mut out);
            out
        });
        let mut out = Tensor::from_vec(products.concat());
        out.add_repeated(&self.biases.value());

        let mut vars = input.vars().clone();
        vars.add(&self.filters);
        vars.add(&self.biases);
        Rc::new(ConvRes {
            input,
            filters: self.filters.clone(),
            biases: self.biases.clone(),
            filter_value,
            mapper,
            batch,
            rows,
            cols,
            count,
            strategy: self.strategy,
            out,
            vars,
        })
    }

    /// Return the filters and biases.
    pub fn parameters(&self) -> Vec<Var> {
        vec![self.filters.clone(), self.biases.clone()]
    }
}

struct ConvRes {
    input: ResRef,
    filters: Var,
    biases: Var,
    filter_value: Rc<Tensor>,
    mapper: Rc<Mapper>,
    batch: usize,
    rows: usize,
    cols: usize,
    count: usize,
    strategy: ConvStrategy,
    out: Tensor,
    vars: VarSet,
}

impl Res for ConvRes {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        if let Some(g) = grad.get_mut(self.biases.id()) {
            *g += &upstream.sum_rows(self.count);
        }
        let need_input = grad.intersects(self.input.vars());
        if !need_input && !grad.contains(self.filters.id()) {
            return;
        }

        let (rows, cols, count) = (self.rows, self.cols, self.count);
        let in_size = self.mapper.in_size();
        let out_size = rows * count;
        let mapping: &Mapper = &self.mapper;
        let images = self.input.output().data();
        let filters = self.filter_value.data();
        let up = upstream.data();

        let downstream = {
            let filter_grad = grad.get_mut(self.filters.id()).map(Mutex::new);
            self.strategy.map_items(self.batch, |i| {
                let u = &up[i * out_size..(i + 1) * out_size];
                if let Some(acc) = &filter_grad {
                    let patches = mapping.map(&images[i * in_size..(i + 1) * in_size]);
                    let mut part = vec![0.0; count * cols];
                    cpu::gemm(true, false, count, cols, rows, 1.0, u, patches.data(), 0.0, &mut part);
                    let mut acc = acc.lock().unwrap_or_else(PoisonError::into_inner);
                    for (a, p) in acc.data_mut().iter_mut().zip(&part) {
                        *a += p;
                    }
                }
                if !need_input {
                    return Vec::new();
                }
                let mut patch_grad = vec![0.0; rows * cols];
                cpu::gemm(false, false, rows, cols, count, 1.0, u, filters, 0.0, &mut patch_grad);
                let mut down = vec![0.0; in_size];
                mapping.map_transpose(&patch_grad, &mut down);
                down
            })
        };

        if need_input {
            self.input.propagate(Tensor::from_vec(downstream.concat()), grad);
        }
    }
}

/// Shape and parameters of a [`Conv`] layer.
#[derive(Serialize, Deserialize)]
pub struct ConvRecord {
    shape: ConvShape,
    filters: Tensor,
    biases: Tensor,
}

impl Codec for Conv {
    const TYPE_ID: &'static str = "anynet.conv.Conv";
    type Record = ConvRecord;

    fn to_record(&self) -> Result<ConvRecord> {
        Ok(ConvRecord {
            shape: self.shape,
            filters: Tensor::clone(&self.filters.value()),
            biases: Tensor::clone(&self.biases.value()),
        })
    }

    fn from_record(r: ConvRecord, opts: &BuildOptions) -> Result<Self> {
        let ConvRecord {
            shape,
            filters,
            biases,
        } = r;
        if shape.stride_x == 0 || shape.stride_y == 0 {
            return Err(Error::InvalidData("zero stride".into()));
        }
        if filters.len() != shape.filter_count * shape.filter_size()
            || biases.len() != shape.filter_count
        {
            return Err(Error::InvalidData(format!(
                "{} filter entries and {} biases do not match {shape:?}",
                filters.len(),
                biases.len()
            )));
        }
        Ok(Self::with_params(shape, filters, biases, opts.conv))
    }
}
