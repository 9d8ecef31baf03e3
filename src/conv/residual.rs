use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{add, pool, ResRef, Var},
    error::Result,
    net::Layer,
    serializer::{BuildOptions, Codec, Tagged},
};

/// A shortcut connection adding a layer's input back onto its output.
#[derive(Clone, Debug)]
pub struct Residual {
    /// The residual mapping.
    pub layer: Layer,
    /// Applied to the input before it is added, for mappings that change dimensions.
    pub projection: Option<Layer>,
}

impl Residual {
    /// Wrap a layer with an identity shortcut.
    pub fn new<L: Into<Layer>>(layer: L) -> Self {
        Self {
            layer: layer.into(),
            projection: None,
        }
    }

    /// Wrap a layer with a projected shortcut.
    pub fn with_projection<L: Into<Layer>, P: Into<Layer>>(layer: L, projection: P) -> Self {
        Self {
            layer: layer.into(),
            projection: Some(projection.into()),
        }
    }

    /// Compute `projection(x) + layer(x)`, or `x + layer(x)` without a projection.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        pool(input, |x| {
            let main = self.layer.apply(x.clone(), batch);
            let shortcut = match &self.projection {
                Some(p) => p.apply(x, batch),
                None => x,
            };
            add(shortcut, main)
        })
    }

    /// Return the parameters of the layer followed by those of the projection.
    pub fn parameters(&self) -> Vec<Var> {
        let mut res = self.layer.parameters();
        if let Some(p) = &self.projection {
            res.extend(p.parameters());
        }
        res
    }
}

/// The encoded mapping and optional projection of a [`Residual`].
#[derive(Serialize, Deserialize)]
pub struct ResidualRecord {
    layer: Tagged,
    projection: Option<Tagged>,
}

impl Codec for Residual {
    const TYPE_ID: &'static str = "anynet.conv.Residual";
    type Record = ResidualRecord;

    fn to_record(&self) -> Result<ResidualRecord> {
        Ok(ResidualRecord {
            layer: self.layer.to_tagged()?,
            projection: self.projection.as_ref().map(Layer::to_tagged).transpose()?,
        })
    }

    fn from_record(r: ResidualRecord, opts: &BuildOptions) -> Result<Self> {
        Ok(Self {
            layer: Layer::from_tagged(&r.layer, opts)?,
            projection: r
                .projection
                .map(|p| Layer::from_tagged(&p, opts))
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        autodiff::{check::ResChecker, constant},
        net::{Activation, Fc},
        tensor::Tensor,
    };

    #[test]
    fn identity_shortcut() {
        let r = Residual::new(Activation::Tanh);
        let out = r.apply(constant(Tensor::from(vec![0.0, 1.0])), 1);
        assert_eq!(out.output().data(), &[0.0, 1.0 + 1f64.tanh()]);
    }

    #[test]
    fn projection_gradients() {
        let mut rng = StdRng::seed_from_u64(5);
        let r = Residual::with_projection(Fc::new(3, 2, &mut rng), Fc::new(3, 2, &mut rng));
        let x = Var::new(Tensor::rand_normal(6, 1.0, &mut rng));
        let mut vars = r.parameters();
        vars.push(x.clone());
        assert_eq!(vars.len(), 5);
        ResChecker::new(|| r.apply(x.res(), 2), vars).assert_gradients();
    }
}
