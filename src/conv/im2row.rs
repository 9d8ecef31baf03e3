use std::{cell::OnceCell, rc::Rc};

use crate::tensor::Mapper;

/// Rearranges the windows of an image into the rows of a matrix.
///
/// Each row holds one window, ordered by window position (rows of windows, then columns), and
/// within a window by `y`, then `x`, then depth. The gather table is built on first use and shared
/// by every graph produced afterwards.
#[derive(Clone, Debug)]
pub struct Im2Row {
    /// Window width.
    pub window_width: usize,
    /// Window height.
    pub window_height: usize,
    /// Horizontal step between windows.
    pub stride_x: usize,
    /// Vertical step between windows.
    pub stride_y: usize,
    /// Image width.
    pub input_width: usize,
    /// Image height.
    pub input_height: usize,
    /// Image depth.
    pub input_depth: usize,
    mapper: OnceCell<Rc<Mapper>>,
}

impl Im2Row {
    /// Describe a windowing of an image.
    pub fn new(
        window: (usize, usize),
        stride: (usize, usize),
        input: (usize, usize, usize),
    ) -> Self {
        assert!(stride.0 > 0 && stride.1 > 0, "stride must be positive");
        Self {
            window_width: window.0,
            window_height: window.1,
            stride_x: stride.0,
            stride_y: stride.1,
            input_width: input.0,
            input_height: input.1,
            input_depth: input.2,
            mapper: OnceCell::new(),
        }
    }

    /// Number of windows along the x axis.
    pub fn num_x(&self) -> usize {
        out_count(self.input_width, self.window_width, self.stride_x)
    }

    /// Number of windows along the y axis.
    pub fn num_y(&self) -> usize {
        out_count(self.input_height, self.window_height, self.stride_y)
    }

    /// Number of rows of the patch matrix.
    pub fn rows(&self) -> usize {
        self.num_x() * self.num_y()
    }

    /// Number of columns of the patch matrix.
    pub fn cols(&self) -> usize {
        self.window_width * self.window_height * self.input_depth
    }

    /// Number of entries of one image.
    pub fn input_size(&self) -> usize {
        self.input_width * self.input_height * self.input_depth
    }

    /// Return the gather table from an image to its patch matrix.
    pub fn mapper(&self) -> Rc<Mapper> {
        Rc::clone(self.mapper.get_or_init(|| Rc::new(self.build())))
    }

    fn build(&self) -> Mapper {
        let mut table = Vec::with_capacity(self.rows() * self.cols());
        for wy in 0..self.num_y() {
            let y = wy * self.stride_y;
            for wx in 0..self.num_x() {
                let x = wx * self.stride_x;
                for sub_y in 0..self.window_height {
                    for sub_x in 0..self.window_width {
                        let base = ((y + sub_y) * self.input_width + x + sub_x) * self.input_depth;
                        table.extend(base..base + self.input_depth);
                    }
                }
            }
        }
        Mapper::new(self.input_size(), table)
    }
}

/// Number of windows of size `window` fitting in `input` with the given stride.
pub(crate) fn out_count(input: usize, window: usize, stride: usize) -> usize {
    if input < window {
        0
    } else {
        1 + (input - window) / stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_order() {
        let im = Im2Row::new((2, 2), (1, 1), (3, 2, 1));
        assert_eq!(im.num_x(), 2);
        assert_eq!(im.num_y(), 1);
        let m = im.mapper();
        assert_eq!(m.table(), &[0, 1, 3, 4, 1, 2, 4, 5]);
    }

    #[test]
    fn too_small_input() {
        let im = Im2Row::new((3, 3), (1, 1), (2, 5, 1));
        assert_eq!(im.rows(), 0);
        assert!(im.mapper().table().is_empty());
    }
}
