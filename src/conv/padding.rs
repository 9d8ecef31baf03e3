use std::{cell::OnceCell, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{Grad, Res, ResRef, VarSet},
    error::Result,
    serializer::{BuildOptions, Codec},
    tensor::{Mapper, Tensor},
};

/// Surrounds images with zeros.
#[derive(Clone, Debug)]
pub struct Padding {
    /// Input width.
    pub input_width: usize,
    /// Input height.
    pub input_height: usize,
    /// Input depth.
    pub input_depth: usize,
    /// Rows added above.
    pub top: usize,
    /// Columns added on the right.
    pub right: usize,
    /// Rows added below.
    pub bottom: usize,
    /// Columns added on the left.
    pub left: usize,
    mapper: OnceCell<Rc<Mapper>>,
}

impl Padding {
    /// Describe a padding of `(width, height, depth)` images by `(top, right, bottom, left)`.
    pub fn new(input: (usize, usize, usize), padding: (usize, usize, usize, usize)) -> Self {
        Self {
            input_width: input.0,
            input_height: input.1,
            input_depth: input.2,
            top: padding.0,
            right: padding.1,
            bottom: padding.2,
            left: padding.3,
            mapper: OnceCell::new(),
        }
    }

    /// Width after padding.
    pub fn output_width(&self) -> usize {
        self.input_width + self.left + self.right
    }

    /// Height after padding.
    pub fn output_height(&self) -> usize {
        self.input_height + self.top + self.bottom
    }

    /// Gather from a padded image back to the original one.
    fn mapper(&self) -> Rc<Mapper> {
        Rc::clone(self.mapper.get_or_init(|| {
            let (new_w, d) = (self.output_width(), self.input_depth);
            let mut table = Vec::with_capacity(self.input_width * self.input_height * d);
            for y in 0..self.input_height {
                let row = (y + self.top) * new_w * d;
                for x in 0..self.input_width {
                    let start = row + (x + self.left) * d;
                    table.extend(start..start + d);
                }
            }
            Rc::new(Mapper::new(new_w * self.output_height() * d, table))
        }))
    }

    /// Apply the layer to `batch` images.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        let mapper = self.mapper();
        assert_eq!(
            input.output().len(),
            batch * mapper.out_size(),
            "incorrect padding input size"
        );
        let out = mapper.batch_map_transpose(input.output());
        Rc::new(PaddingRes { input, mapper, out })
    }
}

struct PaddingRes {
    input: ResRef,
    mapper: Rc<Mapper>,
    out: Tensor,
}

impl Res for PaddingRes {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        self.input.vars()
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        if grad.intersects(self.input.vars()) {
            self.input.propagate(self.mapper.batch_map(&upstream), grad);
        }
    }
}

/// Input dimensions and border sizes of a [`Padding`] layer.
#[derive(Serialize, Deserialize)]
pub struct PaddingRecord {
    input: (usize, usize, usize),
    top: usize,
    right: usize,
    bottom: usize,
    left: usize,
}

impl Codec for Padding {
    const TYPE_ID: &'static str = "anynet.conv.Padding";
    type Record = PaddingRecord;

    fn to_record(&self) -> Result<PaddingRecord> {
        Ok(PaddingRecord {
            input: (self.input_width, self.input_height, self.input_depth),
            top: self.top,
            right: self.right,
            bottom: self.bottom,
            left: self.left,
        })
    }

    fn from_record(r: PaddingRecord, _: &BuildOptions) -> Result<Self> {
        Ok(Self::new(r.input, (r.top, r.right, r.bottom, r.left)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{check::ResChecker, constant, Var};

    #[test]
    fn pads_borders() {
        let p = Padding::new((2, 1, 1), (1, 0, 0, 1));
        let out = p.apply(constant(Tensor::from(vec![5.0, 6.0])), 1);
        assert_eq!(out.output().data(), &[0.0, 0.0, 0.0, 0.0, 5.0, 6.0]);
    }

    #[test]
    fn gradients() {
        let p = Padding::new((3, 4, 2), (1, 1, 2, 3));
        let x = Var::new((0..48).map(|i| i as f64 / 7.0).collect());
        ResChecker::new(|| p.apply(x.res(), 2), vec![x.clone()]).assert_gradients();
    }
}
