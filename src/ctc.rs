//! Connectionist temporal classification.
//!
//! Models emit, at every timestep, log-probabilities over the label symbols followed by a blank
//! symbol. The probability of a label sequence sums over every alignment that reduces to it once
//! repeats are merged and blanks removed.

use std::{ops::Range, rc::Rc};

use rayon::prelude::*;

use crate::{
    autodiff::{concat, constant, scale, slice, sum, Grad, Res, ResRef, Var, VarSet},
    error::{Error, Result, ResultExt},
    rnn::{self, Block},
    seq::{self, Batch as SeqBatch, SeqRef},
    sgd::{cost_gradient, Fetcher, Gradienter, SampleList},
    tensor::{
        cpu::{add_logs, add_logs_deriv},
        Tensor,
    },
};

/// Compute the negative log-likelihood of each sequence's label.
///
/// `labels[i]` holds the symbol indices of sequence `i`; symbols must be below the blank, which
/// is the last entry of every timestep.
///
/// # Panics
///
/// Panics if the number of labels differs from the number of sequences.
pub fn cost(seqs: SeqRef, labels: &[Vec<usize>]) -> ResRef {
    if seqs.output().is_empty() {
        return constant(Tensor::zeros(0));
    }
    let pooled = SeqPool::new(seqs, |steps| {
        assert_eq!(
            steps.len(),
            labels.len(),
            "got {} labels for {} sequences",
            labels.len(),
            steps.len()
        );
        concat(
            steps
                .into_iter()
                .zip(labels)
                .map(|(s, l)| log_likelihood(&s, l))
                .collect(),
        )
    });
    scale(pooled, -1.0)
}

/// Stands in for every sequence of a batch with one variable, so each sequence can be processed
/// on its own.
struct SeqPool {
    input: SeqRef,
    pools: Vec<Var>,
    lengths: Vec<usize>,
    res: ResRef,
}

impl SeqPool {
    fn new<F: FnOnce(Vec<Vec<ResRef>>) -> ResRef>(input: SeqRef, f: F) -> ResRef {
        let separated = seq::separate(input.output());
        let mut pools = Vec::with_capacity(separated.len());
        let mut lengths = Vec::with_capacity(separated.len());
        let mut steps = Vec::with_capacity(separated.len());
        for raw in &separated {
            let pool = Var::new(Tensor::concat(raw));
            let whole = pool.res();
            let chunk = raw.first().map_or(0, Tensor::len);
            steps.push(
                (0..raw.len())
                    .map(|i| slice(whole.clone(), i * chunk, (i + 1) * chunk))
                    .collect(),
            );
            lengths.push(raw.len());
            pools.push(pool);
        }
        let res = f(steps);
        Rc::new(Self {
            input,
            pools,
            lengths,
            res,
        })
    }
}

impl Res for SeqPool {
    fn output(&self) -> &Tensor {
        self.res.output()
    }

    fn vars(&self) -> &VarSet {
        self.input.vars()
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        for p in &self.pools {
            grad.insert_zero(p);
        }
        self.res.propagate(upstream, grad);
        let downstream: Vec<Vec<Tensor>> = self
            .pools
            .iter()
            .zip(&self.lengths)
            .map(|(p, &n)| {
                let g = grad
                    .remove(p.id())
                    .unwrap_or_else(|| Tensor::zeros(p.len()));
                let chunk = if n == 0 { 0 } else { g.len() / n };
                (0..n).map(|i| g.slice(i * chunk, (i + 1) * chunk)).collect()
            })
            .collect();
        self.input.propagate(seq::pack(&downstream), grad);
    }
}

/// The log-likelihood of `label` given a sequence of log-probability vectors.
fn log_likelihood(seq: &[ResRef], label: &[usize]) -> ResRef {
    if seq.is_empty() {
        let value = if label.is_empty() {
            0.0
        } else {
            f64::NEG_INFINITY
        };
        return constant(Tensor::from(vec![value]));
    }

    let label: Rc<[usize]> = label.into();
    let mut init = vec![f64::NEG_INFINITY; label.len() * 2 + 1];
    init[0] = 0.0;
    let mut probs = constant(Tensor::from_vec(init));
    for input in seq {
        probs = LogLikelihoodStep::new(input.clone(), probs, Rc::clone(&label));
    }
    if probs.output().len() == 1 {
        return slice(probs, 0, 1);
    }
    AddLastTwoLogs::new(probs)
}

/// One step of the forward algorithm over the blank-interleaved label positions.
struct LogLikelihoodStep {
    out: Tensor,
    last: ResRef,
    input: ResRef,
    label: Rc<[usize]>,
    vars: VarSet,
}

impl LogLikelihoodStep {
    fn new(input: ResRef, last: ResRef, label: Rc<[usize]>) -> ResRef {
        let x = input.output().data();
        let prev = last.output().data();
        let blank = x[x.len() - 1];
        let mut next = vec![0.0; prev.len()];
        next[0] = prev[0] + blank;
        for i in (2..prev.len()).step_by(2) {
            next[i] = add_logs(prev[i - 1], prev[i]) + blank;
        }
        for i in (1..prev.len()).step_by(2) {
            let li = (i - 1) / 2;
            let mut position_sum = add_logs(prev[i], prev[i - 1]);
            if li > 0 && label[li - 1] != label[li] {
                position_sum = add_logs(position_sum, prev[i - 2]);
            }
            next[i] = x[label[li]] + position_sum;
        }
        let vars = VarSet::merge([input.vars(), last.vars()]);
        Rc::new(Self {
            out: Tensor::from_vec(next),
            last,
            input,
            label,
            vars,
        })
    }
}

impl Res for LogLikelihoodStep {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        &self.vars
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        let prev = self.last.output().data();
        let x = self.input.output().data();
        let blank = x.len() - 1;
        let mut last_grad = vec![0.0; prev.len()];
        let mut input_grad = vec![0.0; x.len()];

        last_grad[0] = upstream[0];
        input_grad[blank] = upstream[0];
        for i in (2..prev.len()).step_by(2) {
            input_grad[blank] += upstream[i];
            let (da, db) = add_logs_deriv(prev[i - 1], prev[i], upstream[i]);
            last_grad[i - 1] += da;
            last_grad[i] += db;
        }
        for i in (1..prev.len()).step_by(2) {
            let li = (i - 1) / 2;
            input_grad[self.label[li]] += upstream[i];
            if li > 0 && self.label[li - 1] != self.label[li] {
                let a = add_logs(prev[i - 2], prev[i - 1]);
                let (da, db) = add_logs_deriv(a, prev[i], upstream[i]);
                last_grad[i] += db;
                let (da, db) = add_logs_deriv(prev[i - 2], prev[i - 1], da);
                last_grad[i - 2] += da;
                last_grad[i - 1] += db;
            } else {
                let (da, db) = add_logs_deriv(prev[i - 1], prev[i], upstream[i]);
                last_grad[i - 1] += da;
                last_grad[i] += db;
            }
        }

        if grad.intersects(self.last.vars()) {
            self.last.propagate(Tensor::from_vec(last_grad), grad);
        }
        if grad.intersects(self.input.vars()) {
            self.input.propagate(Tensor::from_vec(input_grad), grad);
        }
    }
}

/// Log-sum of the last two entries: ending on the final symbol or on the trailing blank.
struct AddLastTwoLogs {
    input: ResRef,
    out: Tensor,
}

impl AddLastTwoLogs {
    fn new(input: ResRef) -> ResRef {
        let v = input.output().data();
        let out = Tensor::from(vec![add_logs(v[v.len() - 1], v[v.len() - 2])]);
        Rc::new(Self { input, out })
    }
}

impl Res for AddLastTwoLogs {
    fn output(&self) -> &Tensor {
        &self.out
    }

    fn vars(&self) -> &VarSet {
        self.input.vars()
    }

    fn propagate(&self, upstream: Tensor, grad: &mut Grad) {
        let v = self.input.output().data();
        let n = v.len();
        let (da, db) = add_logs_deriv(v[n - 1], v[n - 2], upstream[0]);
        let mut down = Tensor::zeros(n);
        down[n - 1] = da;
        down[n - 2] = db;
        self.input.propagate(down, grad);
    }
}

/// Decode the most likely label of every sequence with a prefix search.
///
/// Timesteps whose blank log-probability exceeds `blank_thresh` are taken as certain blanks and
/// split the search into independent segments, which keeps it tractable.
pub fn best_labels(seqs: &[SeqBatch], blank_thresh: f64) -> Vec<Vec<usize>> {
    seq::separate(seqs)
        .iter()
        .map(|s| prefix_search(s, blank_thresh))
        .collect()
}

fn prefix_search(seq: &[Tensor], blank_thresh: f64) -> Vec<usize> {
    let mut segments: Vec<Vec<&[f64]>> = Vec::new();
    let mut current = Vec::new();
    for x in seq {
        let x = x.data();
        if x[x.len() - 1] > blank_thresh {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
        } else {
            current.push(x);
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }

    let mut res = Vec::new();
    for segment in segments {
        let start = LabelProb {
            blank: 0.0,
            no_blank: f64::NEG_INFINITY,
        };
        let (labels, _) = sub_prefix_search(&segment, Vec::new(), start);
        res.extend(labels);
    }
    res
}

#[derive(Clone, Copy, Debug)]
struct LabelProb {
    blank: f64,
    no_blank: f64,
}

impl LabelProb {
    const ZERO: Self = Self {
        blank: f64::NEG_INFINITY,
        no_blank: f64::NEG_INFINITY,
    };

    fn total(&self) -> f64 {
        add_logs(self.blank, self.no_blank)
    }
}

struct Extension {
    addition: Option<usize>,
    prob: LabelProb,
}

fn sub_prefix_search(
    seq: &[&[f64]],
    prefix: Vec<usize>,
    prob: LabelProb,
) -> (Vec<usize>, LabelProb) {
    let Some((next, rest)) = seq.split_first() else {
        return (prefix, prob);
    };
    let mut extensions = extensions(next, &prefix, prob);
    extensions.sort_by(|a, b| b.prob.total().total_cmp(&a.prob.total()));

    let mut best_prob = LabelProb::ZERO;
    let mut best_seq = Vec::new();
    for ext in extensions {
        if ext.prob.total() <= best_prob.total() {
            continue;
        }
        let mut extended = prefix.clone();
        extended.extend(ext.addition);
        let (labels, final_prob) = sub_prefix_search(rest, extended, ext.prob);
        if final_prob.total() > best_prob.total() {
            best_prob = final_prob;
            best_seq = labels;
        }
    }
    (best_seq, best_prob)
}

fn extensions(next: &[f64], label: &[usize], prob: LabelProb) -> Vec<Extension> {
    let blank = next.len() - 1;
    let last = label.last().copied();
    let mut res: Vec<Extension> = next[..blank]
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let base = if last == Some(i) {
                prob.blank
            } else {
                prob.total()
            };
            Extension {
                addition: Some(i),
                prob: LabelProb {
                    blank: f64::NEG_INFINITY,
                    no_blank: p + base,
                },
            }
        })
        .collect();
    res.push(Extension {
        addition: None,
        prob: LabelProb {
            blank: prob.total() + next[blank],
            no_blank: last.map_or(f64::NEG_INFINITY, |l| prob.no_blank + next[l]),
        },
    });
    res
}

/// An input sequence of feature vectors and its label.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sample {
    /// Input vectors, one per timestep.
    pub input: Vec<Tensor>,
    /// Label symbols.
    pub label: Vec<usize>,
}

/// A sample list held in memory.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SliceSampleList(pub Vec<Sample>);

impl SampleList for SliceSampleList {
    type Sample = Sample;

    fn len(&self) -> usize {
        self.0.len()
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.0.swap(i, j);
    }

    fn get(&self, i: usize) -> Result<Sample> {
        Ok(self.0[i].clone())
    }
}

/// Packed input sequences and their labels.
#[derive(Clone)]
pub struct Batch {
    /// Input sequences.
    pub inputs: SeqRef,
    /// One label per sequence.
    pub labels: Vec<Vec<usize>>,
}

/// Load the samples in `range` on the rayon pool and pack them into a batch.
pub fn fetch_batch<L>(samples: &L, range: Range<usize>) -> Result<Batch>
where
    L: SampleList<Sample = Sample> + Sync,
{
    if range.is_empty() {
        return Err(Error::EmptyBatch).context("fetch batch");
    }
    let loaded = range
        .into_par_iter()
        .map(|i| samples.get(i))
        .collect::<Result<Vec<_>>>()
        .context("fetch batch")?;
    let (ins, labels): (Vec<_>, Vec<_>) = loaded.into_iter().map(|s| (s.input, s.label)).unzip();
    Ok(Batch {
        inputs: seq::const_seq_list(&ins),
        labels,
    })
}

/// Fetches batches and computes CTC gradients for a model producing log-probabilities.
pub struct Trainer {
    /// The model.
    pub func: Box<dyn Fn(SeqRef) -> SeqRef>,
    /// Variables to differentiate.
    pub params: Vec<Var>,
    /// Average the per-sequence costs instead of summing them.
    pub average: bool,
    /// Total cost of the last batch passed to [`Gradienter::gradient`].
    pub last_cost: f64,
}

impl Trainer {
    /// Create an averaging trainer for an arbitrary sequence function.
    pub fn new<F>(func: F, params: Vec<Var>) -> Self
    where
        F: Fn(SeqRef) -> SeqRef + 'static,
    {
        Self {
            func: Box::new(func),
            params,
            average: true,
            last_cost: 0.0,
        }
    }

    /// Create an averaging trainer for a recurrent block over all of its parameters.
    pub fn for_block(block: Block) -> Self {
        let params = block.parameters();
        Self::new(move |s| rnn::map(s, &block), params)
    }

    /// Build the graph of the (possibly averaged) total cost of a batch.
    pub fn total_cost(&self, batch: &Batch) -> ResRef {
        let costs = cost((self.func)(batch.inputs.clone()), &batch.labels);
        let n = costs.output().len();
        let total = sum(costs);
        if self.average && n > 0 {
            scale(total, 1.0 / n as f64)
        } else {
            total
        }
    }
}

impl<L: SampleList<Sample = Sample> + Sync> Fetcher<L> for Trainer {
    type Batch = Batch;

    fn fetch(&self, samples: &L, range: Range<usize>) -> Result<Batch> {
        fetch_batch(samples, range)
    }
}

impl Gradienter<Batch> for Trainer {
    fn gradient(&mut self, batch: &Batch) -> Grad {
        let total = self.total_cost(batch);
        self.last_cost = total.output()[0];
        tracing::debug!(cost = self.last_cost, sequences = batch.labels.len(), "CTC gradient");
        cost_gradient(&total, &self.params)
    }
}
