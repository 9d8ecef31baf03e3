use serde::{Deserialize, Serialize};

use crate::{
    autodiff::Var,
    error::Result,
    net::AddMixer,
    seq::{self, SeqRef},
    serializer::{BuildOptions, Codec, Tagged},
};

use super::{map, Block};

/// Runs one block forward and another backward in time over each sequence, then mixes their
/// outputs at every timestep.
///
/// Unlike a [`Block`], a `Bidir` needs whole sequences up front, so it works on a
/// [`Seq`](crate::seq::Seq) rather than step by step.
#[derive(Clone, Debug)]
pub struct Bidir {
    /// Block run from the first timestep to the last.
    pub forward: Block,
    /// Block run from the last timestep to the first.
    pub backward: Block,
    /// Combines the forward output (first) with the backward output (second).
    pub mixer: AddMixer,
}

impl Bidir {
    /// Apply the block to a sequence batch whose sequences all start at the first timestep.
    pub fn apply(&self, input: SeqRef) -> SeqRef {
        seq::pool(input, |x| {
            let forward = map(x.clone(), &self.forward);
            let backward = seq::reverse(map(seq::reverse(x), &self.backward));
            seq::map_n(vec![forward, backward], |v, n| {
                self.mixer.mix(v[0].clone(), v[1].clone(), n)
            })
        })
    }

    /// Return the parameters of the forward block, the backward block and the mixer.
    pub fn parameters(&self) -> Vec<Var> {
        let mut res = self.forward.parameters();
        res.extend(self.backward.parameters());
        res.extend(self.mixer.parameters());
        res
    }
}

/// Both blocks and the mixer of a [`Bidir`].
#[derive(Serialize, Deserialize)]
pub struct BidirRecord {
    forward: Tagged,
    backward: Tagged,
    mixer: Tagged,
}

impl Codec for Bidir {
    const TYPE_ID: &'static str = "anynet.rnn.Bidir";
    type Record = BidirRecord;

    fn to_record(&self) -> Result<BidirRecord> {
        Ok(BidirRecord {
            forward: self.forward.to_tagged()?,
            backward: self.backward.to_tagged()?,
            mixer: Tagged::new(&self.mixer)?,
        })
    }

    fn from_record(r: BidirRecord, opts: &BuildOptions) -> Result<Self> {
        Ok(Self {
            forward: Block::from_tagged(&r.forward, opts)?,
            backward: Block::from_tagged(&r.backward, opts)?,
            mixer: r.mixer.decode(opts)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        autodiff::{check::ResChecker, concat, ResRef},
        net::{Activation, ConstAffine, Fc, Layer},
        rnn::{LayerBlock, Lstm, Vanilla},
        serializer,
        tensor::Tensor,
    };

    fn bidir(rng: &mut StdRng) -> Bidir {
        let b = Bidir {
            forward: Vanilla::new(3, 2, Activation::Tanh, rng).into(),
            backward: Lstm::new(3, 4, rng).into(),
            mixer: AddMixer {
                in1: Fc::new(2, 3, rng).into(),
                in2: Fc::new(4, 3, rng).into(),
                out: Activation::Tanh.into(),
            },
        };
        for p in b.parameters() {
            p.set(Tensor::rand_normal(p.len(), 0.5, rng));
        }
        b
    }

    fn inputs(rng: &mut StdRng) -> Vec<Vec<Var>> {
        [3, 1, 2]
            .iter()
            .map(|&n| {
                (0..n)
                    .map(|_| Var::new(Tensor::rand_normal(3, 1.0, rng)))
                    .collect()
            })
            .collect()
    }

    fn input_seq(ins: &[Vec<Var>]) -> SeqRef {
        let steps = ins.iter().map(Vec::len).max().unwrap_or(0);
        let mut res = Vec::with_capacity(steps);
        for t in 0..steps {
            let present: Vec<bool> = ins.iter().map(|s| t < s.len()).collect();
            let parts: Vec<ResRef> = ins
                .iter()
                .filter(|s| t < s.len())
                .map(|s| s[t].res())
                .collect();
            res.push((concat(parts), seq::PresentMap::new(present)));
        }
        seq::from_res(res)
    }

    #[test]
    fn backward_block_runs_on_reversed_sequences() {
        let mut rng = StdRng::seed_from_u64(0);
        let ins = inputs(&mut rng);
        let identity = || Layer::from(ConstAffine { scale: 1.0, bias: 0.0 });
        let b = Bidir {
            forward: LayerBlock::new(Fc::new(3, 1, &mut rng)).into(),
            backward: Vanilla::new(3, 1, identity(), &mut rng).into(),
            mixer: AddMixer {
                in1: identity(),
                in2: identity(),
                out: identity(),
            },
        };
        let out = seq::separate(b.apply(input_seq(&ins)).output());
        assert_eq!(out.len(), ins.len());
        for (s, got) in ins.iter().zip(&out) {
            let values: Vec<Tensor> = s.iter().map(|v| Tensor::clone(&v.value())).collect();
            let mut reversed = values.clone();
            reversed.reverse();
            let fwd = map(seq::const_seq_list(&[values]), &b.forward);
            let back = map(seq::const_seq_list(&[reversed]), &b.backward);
            let (fwd, back) = (seq::separate(fwd.output()), seq::separate(back.output()));
            assert_eq!(got.len(), s.len());
            for t in 0..s.len() {
                let expected = fwd[0][t][0] + back[0][s.len() - 1 - t][0];
                assert!((got[t][0] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn gradients() {
        let mut rng = StdRng::seed_from_u64(1);
        let b = bidir(&mut rng);
        let ins = inputs(&mut rng);
        let mut vars = b.parameters();
        vars.extend(ins.iter().flatten().cloned());
        let f = || -> ResRef { seq::concat_all(b.apply(input_seq(&ins))) };
        let mut checker = ResChecker::new(f, vars);
        checker.prec = 1e-4;
        checker.assert_gradients();
    }

    #[test]
    fn round_trip() {
        let mut rng = StdRng::seed_from_u64(2);
        let b = bidir(&mut rng);
        let data = serializer::serialize(&b).unwrap();
        let decoded: Bidir = serializer::deserialize(&data, &BuildOptions::default()).unwrap();
        assert_eq!(decoded.parameters().len(), b.parameters().len());

        let ins = inputs(&mut rng);
        let x = b.apply(input_seq(&ins));
        let y = decoded.apply(input_seq(&ins));
        for (a, b) in x.output().iter().zip(y.output()) {
            assert_eq!(a.packed, b.packed);
        }
    }
}
