use serde::{Deserialize, Serialize};

use crate::{
    autodiff::{add, ResRef, Var},
    error::Result,
    serializer::{BuildOptions, Codec, Tagged},
};

use super::Layer;

/// Combines two inputs as `out(in1(a) + in2(b))`.
#[derive(Clone, Debug)]
pub struct AddMixer {
    /// Transform of the first input.
    pub in1: Layer,
    /// Transform of the second input.
    pub in2: Layer,
    /// Transform of the sum.
    pub out: Layer,
}

impl AddMixer {
    /// Mix two packed batches of `batch` entries each.
    pub fn mix(&self, a: ResRef, b: ResRef, batch: usize) -> ResRef {
        let sum = add(self.in1.apply(a, batch), self.in2.apply(b, batch));
        self.out.apply(sum, batch)
    }

    /// Return the parameters of the three transforms.
    pub fn parameters(&self) -> Vec<Var> {
        let mut res = self.in1.parameters();
        res.extend(self.in2.parameters());
        res.extend(self.out.parameters());
        res
    }
}

/// The three encoded transforms of an [`AddMixer`].
#[derive(Serialize, Deserialize)]
pub struct AddMixerRecord {
    in1: Tagged,
    in2: Tagged,
    out: Tagged,
}

impl Codec for AddMixer {
    const TYPE_ID: &'static str = "anynet.AddMixer";
    type Record = AddMixerRecord;

    fn to_record(&self) -> Result<AddMixerRecord> {
        Ok(AddMixerRecord {
            in1: self.in1.to_tagged()?,
            in2: self.in2.to_tagged()?,
            out: self.out.to_tagged()?,
        })
    }

    fn from_record(r: AddMixerRecord, opts: &BuildOptions) -> Result<Self> {
        Ok(Self {
            in1: Layer::from_tagged(&r.in1, opts)?,
            in2: Layer::from_tagged(&r.in2, opts)?,
            out: Layer::from_tagged(&r.out, opts)?,
        })
    }
}
