//! Differentiable batches of variable-length sequences.
//!
//! A sequence batch is a list of timesteps. Each timestep packs the vectors of the sequences that
//! are still running, in order, and records which sequences those are in a [`PresentMap`].

use std::rc::Rc;

use crate::{
    autodiff::{sum, Grad, Res, ResRef, Var, VarSet},
    tensor::Tensor,
};

/// Marks which sequences of a batch take part in a timestep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PresentMap(Vec<bool>);

impl From<Vec<bool>> for PresentMap {
    fn from(v: Vec<bool>) -> Self {
        Self(v)
    }
}

impl PresentMap {
    /// Create a map from per-sequence flags.
    pub fn new(flags: Vec<bool>) -> Self {
        Self(flags)
    }

    /// Create a map where all `n` sequences are present.
    pub fn all(n: usize) -> Self {
        Self(vec![true; n])
    }

    /// Return the total number of sequences.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the batch has no sequences.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Count the present sequences.
    pub fn num_present(&self) -> usize {
        self.0.iter().filter(|&&p| p).count()
    }

    /// Check whether sequence `i` is present.
    pub fn is_present(&self, i: usize) -> bool {
        self.0[i]
    }

    /// Return the flags.
    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    /// Check whether every present sequence of `self` is also present in `other`.
    pub fn is_subset_of(&self, other: &PresentMap) -> bool {
        self.len() == other.len() && self.0.iter().zip(&other.0).all(|(&a, &b)| !a || b)
    }
}

/// One timestep of a sequence batch.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    /// Vectors of the present sequences, concatenated.
    pub packed: Tensor,
    /// Which sequences are present.
    pub present: PresentMap,
}

impl Batch {
    /// Return the length of each packed vector.
    pub fn chunk_size(&self) -> usize {
        match self.present.num_present() {
            0 => 0,
            n => self.packed.len() / n,
        }
    }
}

/// The result of a differentiable sequence computation.
pub trait Seq {
    /// Return the timesteps.
    fn output(&self) -> &[Batch];

    /// Return every variable the output depends on.
    fn vars(&self) -> &VarSet;

    /// Accumulate gradients given one upstream batch per timestep.
    fn propagate(&self, upstream: Vec<Batch>, grad: &mut Grad);
}

/// A shared handle to a sequence node.
pub type SeqRef = Rc<dyn Seq>;

struct ConstSeq {
    batches: Vec<Batch>,
    vars: VarSet,
}

impl Seq for ConstSeq {
    fn output(&self) -> &[Batch] {
        &self.batches
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, _: Vec<Batch>, _: &mut Grad) {}
}

/// Create a constant sequence batch.
pub fn constant(batches: Vec<Batch>) -> SeqRef {
    Rc::new(ConstSeq {
        batches,
        vars: VarSet::new(),
    })
}

/// Pack a list of sequences, each a list of equal-length vectors, into timesteps.
pub fn pack(seqs: &[Vec<Tensor>]) -> Vec<Batch> {
    let steps = seqs.iter().map(Vec::len).max().unwrap_or(0);
    (0..steps)
        .map(|t| {
            let present: Vec<bool> = seqs.iter().map(|s| s.len() > t).collect();
            let packed = Tensor::concat(seqs.iter().filter_map(|s| s.get(t)));
            Batch {
                packed,
                present: PresentMap(present),
            }
        })
        .collect()
}

/// Create a constant sequence batch from a list of sequences.
pub fn const_seq_list(seqs: &[Vec<Tensor>]) -> SeqRef {
    constant(pack(seqs))
}

/// Split timesteps back into one list of vectors per sequence.
pub fn separate(batches: &[Batch]) -> Vec<Vec<Tensor>> {
    let Some(first) = batches.first() else {
        return Vec::new();
    };
    let mut seqs = vec![Vec::new(); first.present.len()];
    for b in batches {
        let chunk = b.chunk_size();
        let mut offset = 0;
        for (i, seq) in seqs.iter_mut().enumerate() {
            if b.present.is_present(i) {
                seq.push(b.packed.slice(offset, offset + chunk));
                offset += chunk;
            }
        }
    }
    seqs
}

struct ResSeq {
    steps: Vec<ResRef>,
    out: Vec<Batch>,
    vars: VarSet,
}

impl Seq for ResSeq {
    fn output(&self) -> &[Batch] {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Vec<Batch>, grad: &mut Grad) {
        for (step, u) in self.steps.iter().zip(upstream) {
            if grad.intersects(step.vars()) {
                step.propagate(u.packed, grad);
            }
        }
    }
}

/// Create a sequence whose timesteps are arbitrary graph nodes.
pub fn from_res(steps: Vec<(ResRef, PresentMap)>) -> SeqRef {
    let vars = VarSet::merge(steps.iter().map(|(r, _)| r.vars()));
    let out = steps
        .iter()
        .map(|(r, p)| Batch {
            packed: r.output().clone(),
            present: p.clone(),
        })
        .collect();
    Rc::new(ResSeq {
        steps: steps.into_iter().map(|(r, _)| r).collect(),
        out,
        vars,
    })
}

struct MapSeq {
    input: SeqRef,
    pools: Vec<Var>,
    steps: Vec<ResRef>,
    out: Vec<Batch>,
    vars: VarSet,
}

impl Seq for MapSeq {
    fn output(&self) -> &[Batch] {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Vec<Batch>, grad: &mut Grad) {
        let need_input = grad.intersects(self.input.vars());
        if need_input {
            for p in &self.pools {
                grad.insert_zero(p);
            }
        }
        for (step, u) in self.steps.iter().zip(upstream) {
            step.propagate(u.packed, grad);
        }
        if need_input {
            let down = self
                .pools
                .iter()
                .zip(self.input.output())
                .map(|(p, b)| Batch {
                    packed: grad
                        .remove(p.id())
                        .unwrap_or_else(|| Tensor::zeros(p.len())),
                    present: b.present.clone(),
                })
                .collect();
            self.input.propagate(down, grad);
        }
    }
}

/// Apply a function to every timestep. The function receives the timestep and the number of
/// present sequences.
pub fn map<F: FnMut(ResRef, usize) -> ResRef>(input: SeqRef, mut f: F) -> SeqRef {
    let mut vars = input.vars().clone();
    let mut pools = Vec::new();
    let mut steps = Vec::new();
    let mut out = Vec::new();
    for b in input.output() {
        let p = Var::new(b.packed.clone());
        let r = f(p.res(), b.present.num_present());
        let mut step_vars = r.vars().clone();
        step_vars.del(p.id());
        vars.extend(&step_vars);
        out.push(Batch {
            packed: r.output().clone(),
            present: b.present.clone(),
        });
        pools.push(p);
        steps.push(r);
    }
    Rc::new(MapSeq {
        input,
        pools,
        steps,
        out,
        vars,
    })
}

struct MapNSeq {
    inputs: Vec<SeqRef>,
    pools: Vec<Vec<Var>>,
    steps: Vec<ResRef>,
    out: Vec<Batch>,
    vars: VarSet,
}

impl Seq for MapNSeq {
    fn output(&self) -> &[Batch] {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Vec<Batch>, grad: &mut Grad) {
        let needed: Vec<bool> = self
            .inputs
            .iter()
            .map(|s| grad.intersects(s.vars()))
            .collect();
        for (pools, &need) in self.pools.iter().zip(&needed) {
            if need {
                for p in pools {
                    grad.insert_zero(p);
                }
            }
        }
        for (step, u) in self.steps.iter().zip(upstream) {
            step.propagate(u.packed, grad);
        }
        for ((input, pools), &need) in self.inputs.iter().zip(&self.pools).zip(&needed) {
            if !need {
                continue;
            }
            let down = pools
                .iter()
                .zip(input.output())
                .map(|(p, b)| Batch {
                    packed: grad
                        .remove(p.id())
                        .unwrap_or_else(|| Tensor::zeros(p.len())),
                    present: b.present.clone(),
                })
                .collect();
            input.propagate(down, grad);
        }
    }
}

/// Apply a function to corresponding timesteps of several sequence batches. The function
/// receives one node per input and the number of present sequences.
///
/// # Panics
///
/// Panics unless every input has the same timesteps and present maps.
pub fn map_n<F: FnMut(&[ResRef], usize) -> ResRef>(inputs: Vec<SeqRef>, mut f: F) -> SeqRef {
    let steps_len = inputs.first().map_or(0, |s| s.output().len());
    for s in &inputs {
        assert_eq!(s.output().len(), steps_len, "mismatching sequence lengths");
    }
    let mut vars = VarSet::merge(inputs.iter().map(|s| s.vars()));
    let mut pools: Vec<Vec<Var>> = vec![Vec::with_capacity(steps_len); inputs.len()];
    let mut steps = Vec::with_capacity(steps_len);
    let mut out = Vec::with_capacity(steps_len);
    for t in 0..steps_len {
        let present = &inputs[0].output()[t].present;
        let mut args = Vec::with_capacity(inputs.len());
        for (s, ps) in inputs.iter().zip(pools.iter_mut()) {
            let b = &s.output()[t];
            assert_eq!(&b.present, present, "mismatching present maps");
            let p = Var::new(b.packed.clone());
            args.push(p.res());
            ps.push(p);
        }
        let r = f(&args, present.num_present());
        let mut step_vars = r.vars().clone();
        for ps in &pools {
            step_vars.del(ps[t].id());
        }
        vars.extend(&step_vars);
        out.push(Batch {
            packed: r.output().clone(),
            present: present.clone(),
        });
        steps.push(r);
    }
    Rc::new(MapNSeq {
        inputs,
        pools,
        steps,
        out,
        vars,
    })
}

struct ReverseSeq {
    input: SeqRef,
    out: Vec<Batch>,
}

impl Seq for ReverseSeq {
    fn output(&self) -> &[Batch] {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        self.input.vars()
    }

    fn propagate(&self, upstream: Vec<Batch>, grad: &mut Grad) {
        if grad.intersects(self.input.vars()) {
            self.input.propagate(reverse_batches(&upstream), grad);
        }
    }
}

fn reverse_batches(batches: &[Batch]) -> Vec<Batch> {
    let mut seqs = separate(batches);
    for s in &mut seqs {
        s.reverse();
    }
    pack(&seqs)
}

/// Reverse every sequence of a batch in time.
///
/// Sequences must start at the first timestep, as produced by [`pack`]; the reversed batch is
/// laid out the same way.
pub fn reverse(input: SeqRef) -> SeqRef {
    let out = reverse_batches(input.output());
    Rc::new(ReverseSeq { input, out })
}

struct PoolSeq {
    input: SeqRef,
    tmp: Vec<Var>,
    res: SeqRef,
    vars: VarSet,
}

impl Seq for PoolSeq {
    fn output(&self) -> &[Batch] {
        self.res.output()
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Vec<Batch>, grad: &mut Grad) {
        if !grad.intersects(self.input.vars()) {
            self.res.propagate(upstream, grad);
            return;
        }
        for p in &self.tmp {
            grad.insert_zero(p);
        }
        self.res.propagate(upstream, grad);
        let down = self
            .tmp
            .iter()
            .zip(self.input.output())
            .map(|(p, b)| Batch {
                packed: grad
                    .remove(p.id())
                    .unwrap_or_else(|| Tensor::zeros(p.len())),
                present: b.present.clone(),
            })
            .collect();
        self.input.propagate(down, grad);
    }
}

/// Evaluate `f` on a stand-in for `input` so that `input` is propagated exactly once.
pub fn pool<F: FnOnce(SeqRef) -> SeqRef>(input: SeqRef, f: F) -> SeqRef {
    let tmp: Vec<Var> = input
        .output()
        .iter()
        .map(|b| Var::new(b.packed.clone()))
        .collect();
    let stand_in = from_res(
        tmp.iter()
            .zip(input.output())
            .map(|(v, b)| (v.res(), b.present.clone()))
            .collect(),
    );
    let res = f(stand_in);
    let mut vars = res.vars().clone();
    for v in &tmp {
        vars.del(v.id());
    }
    vars.extend(input.vars());
    Rc::new(PoolSeq {
        input,
        tmp,
        res,
        vars,
    })
}

struct ConcatAll {
    input: SeqRef,
    out: Tensor,
}

impl Res for ConcatAll {
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
        let mut offset = 0;
        let down = self
            .input
            .output()
            .iter()
            .map(|b| {
                let n = b.packed.len();
                offset += n;
                Batch {
                    packed: upstream.slice(offset - n, offset),
                    present: b.present.clone(),
                }
            })
            .collect();
        self.input.propagate(down, grad);
    }
}

/// Concatenate every timestep of a sequence batch into one node.
pub fn concat_all(input: SeqRef) -> ResRef {
    let out = Tensor::concat(input.output().iter().map(|b| &b.packed));
    Rc::new(ConcatAll { input, out })
}

/// Sum every entry of every timestep.
pub fn sum_all(input: SeqRef) -> ResRef {
    sum(concat_all(input))
}

struct Tail {
    input: SeqRef,
    // Timestep, offset and length of each sequence's last vector.
    ends: Vec<(usize, usize, usize)>,
    out: Tensor,
}

impl Res for Tail {
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
        let mut down: Vec<Batch> = self
            .input
            .output()
            .iter()
            .map(|b| Batch {
                packed: Tensor::zeros(b.packed.len()),
                present: b.present.clone(),
            })
            .collect();
        let mut src = 0;
        for &(t, offset, len) in &self.ends {
            down[t].packed.data_mut()[offset..offset + len]
                .copy_from_slice(&upstream.data()[src..src + len]);
            src += len;
        }
        self.input.propagate(down, grad);
    }
}

/// Pack the last timestep of every sequence, in sequence order.
///
/// # Panics
///
/// Panics if a sequence has no timesteps.
pub fn tail(input: SeqRef) -> ResRef {
    let n = input.output().first().map_or(0, |b| b.present.len());
    let mut ends = vec![None; n];
    for (t, b) in input.output().iter().enumerate() {
        let chunk = b.chunk_size();
        let mut offset = 0;
        for (i, end) in ends.iter_mut().enumerate() {
            if b.present.is_present(i) {
                *end = Some((t, offset, chunk));
                offset += chunk;
            }
        }
    }
    let ends: Vec<(usize, usize, usize)> = ends
        .into_iter()
        .map(|e| e.unwrap_or_else(|| panic!("empty sequence has no last timestep")))
        .collect();
    let mut out = Vec::new();
    for &(t, offset, len) in &ends {
        out.extend_from_slice(&input.output()[t].packed.data()[offset..offset + len]);
    }
    Rc::new(Tail {
        input,
        ends,
        out: Tensor::from_vec(out),
    })
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::autodiff::{check::ResChecker, concat, mul, tanh};

    fn t(v: &[f64]) -> Tensor {
        Tensor::from(v)
    }

    #[test]
    fn pack_and_separate() {
        let seqs = vec![
            vec![t(&[1.0]), t(&[2.0]), t(&[3.0])],
            vec![],
            vec![t(&[4.0])],
        ];
        let batches = pack(&seqs);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].packed.data(), &[1.0, 4.0]);
        assert_eq!(batches[0].present.as_slice(), &[true, false, true]);
        assert_eq!(batches[2].present.num_present(), 1);
        assert_eq!(separate(&batches), seqs);
    }

    #[test]
    fn subset_check() {
        let a = PresentMap::new(vec![true, false, true]);
        let b = PresentMap::new(vec![true, false, false]);
        assert!(b.is_subset_of(&a));
        assert!(!a.is_subset_of(&b));
    }

    fn var_seq(seqs: &[Vec<Var>]) -> SeqRef {
        let steps = seqs.iter().map(Vec::len).max().unwrap_or(0);
        from_res(
            (0..steps)
                .map(|t| {
                    let present: Vec<bool> = seqs.iter().map(|s| t < s.len()).collect();
                    let parts = seqs.iter().filter_map(|s| s.get(t)).map(Var::res).collect();
                    (concat(parts), PresentMap::new(present))
                })
                .collect(),
        )
    }

    fn var_seqs(lens: &[usize], dim: usize, rng: &mut StdRng) -> Vec<Vec<Var>> {
        lens.iter()
            .map(|&n| {
                (0..n)
                    .map(|_| Var::new(Tensor::rand_normal(dim, 1.0, rng)))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn reverse_flips_each_sequence() {
        let seqs = vec![
            vec![t(&[1.0]), t(&[2.0]), t(&[3.0])],
            vec![t(&[4.0])],
            vec![t(&[5.0]), t(&[6.0])],
        ];
        let out = reverse(const_seq_list(&seqs));
        assert_eq!(
            separate(out.output()),
            vec![
                vec![t(&[3.0]), t(&[2.0]), t(&[1.0])],
                vec![t(&[4.0])],
                vec![t(&[6.0]), t(&[5.0])],
            ]
        );
        assert_eq!(out.output()[1].present.as_slice(), &[true, false, true]);
    }

    #[test]
    fn tail_takes_last_vectors() {
        let seqs = vec![
            vec![t(&[1.0, 1.5]), t(&[2.0, 2.5])],
            vec![t(&[3.0, 3.5])],
            vec![t(&[4.0, 4.5]), t(&[5.0, 5.5]), t(&[6.0, 6.5])],
        ];
        let out = tail(const_seq_list(&seqs));
        assert_eq!(out.output().data(), &[2.0, 2.5, 3.0, 3.5, 6.0, 6.5]);
    }

    #[test]
    fn combinator_gradients() {
        let mut rng = StdRng::seed_from_u64(0);
        let a = var_seqs(&[3, 1, 2], 2, &mut rng);
        let b = var_seqs(&[3, 1, 2], 2, &mut rng);
        let vars: Vec<Var> = a.iter().chain(&b).flatten().cloned().collect();
        let f = || -> ResRef {
            let pooled = pool(var_seq(&a), |x| {
                let flipped = map(reverse(x.clone()), |r, _| tanh(r));
                map_n(vec![x, reverse(flipped), var_seq(&b)], |v, _| {
                    mul(v[0].clone(), mul(v[1].clone(), v[2].clone()))
                })
            });
            concat(vec![concat_all(pooled.clone()), tail(pooled)])
        };
        ResChecker::new(f, vars).assert_gradients();
    }
}
