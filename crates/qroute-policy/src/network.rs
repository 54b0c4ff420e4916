//! Dense feed-forward Q-network with manual backpropagation.
//!
//! `input -> hidden -> hidden -> hidden -> actions`, ReLU between layers and a
//! linear output. The same type doubles as the gradient accumulator so that
//! parameters, gradients and optimizer moments share one flat ordering.

use rand::Rng;
use serde::{Deserialize, Serialize};

const HIDDEN_LAYERS: usize = 3;

/// Fully connected layer. Weights are row-major `[outputs][inputs]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Dense {
    inputs: usize,
    outputs: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

impl Dense {
    /// Uniform init in `±1/sqrt(fan_in)`.
    fn init<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (inputs as f32).sqrt();
        let weights = (0..inputs * outputs)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let bias = (0..outputs).map(|_| rng.gen_range(-bound..bound)).collect();
        Self {
            inputs,
            outputs,
            weights,
            bias,
        }
    }

    fn zeros(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs,
            outputs,
            weights: vec![0.0; inputs * outputs],
            bias: vec![0.0; outputs],
        }
    }

    fn row(&self, o: usize) -> &[f32] {
        &self.weights[o * self.inputs..(o + 1) * self.inputs]
    }

    fn forward_into(&self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        for o in 0..self.outputs {
            let dot: f32 = self.row(o).iter().zip(input).map(|(w, x)| w * x).sum();
            out.push(dot + self.bias[o]);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QNetwork {
    layers: Vec<Dense>,
}

impl QNetwork {
    pub fn new<R: Rng + ?Sized>(inputs: usize, hidden: usize, actions: usize, rng: &mut R) -> Self {
        let mut layers = Vec::with_capacity(HIDDEN_LAYERS + 1);
        let mut fan_in = inputs;
        for _ in 0..HIDDEN_LAYERS {
            layers.push(Dense::init(fan_in, hidden, rng));
            fan_in = hidden;
        }
        layers.push(Dense::init(fan_in, actions, rng));
        Self { layers }
    }

    /// Same shape, every parameter zero.
    pub fn zeros_like(&self) -> Self {
        Self {
            layers: self
                .layers
                .iter()
                .map(|l| Dense::zeros(l.inputs, l.outputs))
                .collect(),
        }
    }

    /// Layer widths from input to output, e.g. `[10, 128, 128, 128, 3]`.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.layers.len() + 1);
        if let Some(first) = self.layers.first() {
            shape.push(first.inputs);
        }
        shape.extend(self.layers.iter().map(|l| l.outputs));
        shape
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, |l| l.inputs)
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, |l| l.outputs)
    }

    pub fn param_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.bias.len())
            .sum()
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        let mut act = input.to_vec();
        let mut next = Vec::new();
        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.forward_into(&act, &mut next);
            if i < last {
                relu(&mut next);
            }
            std::mem::swap(&mut act, &mut next);
        }
        act
    }

    /// Forward pass that also returns the input seen by every layer.
    pub(crate) fn forward_trace(&self, input: &[f32]) -> (Vec<Vec<f32>>, Vec<f32>) {
        let mut trace = Vec::with_capacity(self.layers.len());
        let mut act = input.to_vec();
        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            let mut out = Vec::with_capacity(layer.outputs);
            layer.forward_into(&act, &mut out);
            if i < last {
                relu(&mut out);
            }
            trace.push(std::mem::replace(&mut act, out));
        }
        (trace, act)
    }

    /// Add `upstream * d q[action] / d params` into `grads`.
    pub(crate) fn accumulate_action_grad(
        &self,
        trace: &[Vec<f32>],
        action: usize,
        upstream: f32,
        grads: &mut QNetwork,
    ) {
        let Some(out_layer) = self.layers.last() else {
            return;
        };
        let mut delta = vec![0.0_f32; out_layer.outputs];
        delta[action] = upstream;

        for l in (0..self.layers.len()).rev() {
            let layer = &self.layers[l];
            let input = &trace[l];
            let grad = &mut grads.layers[l];

            for (o, &d) in delta.iter().enumerate() {
                if d == 0.0 {
                    continue;
                }
                grad.bias[o] += d;
                let row = &mut grad.weights[o * layer.inputs..(o + 1) * layer.inputs];
                for (g, x) in row.iter_mut().zip(input) {
                    *g += d * x;
                }
            }

            if l == 0 {
                break;
            }
            let mut prev = vec![0.0_f32; layer.inputs];
            for (o, &d) in delta.iter().enumerate() {
                if d == 0.0 {
                    continue;
                }
                for (p, w) in prev.iter_mut().zip(layer.row(o)) {
                    *p += w * d;
                }
            }
            // `input` is the post-ReLU activation of the layer below.
            for (p, x) in prev.iter_mut().zip(input) {
                if *x <= 0.0 {
                    *p = 0.0;
                }
            }
            delta = prev;
        }
    }

    pub(crate) fn params(&self) -> impl Iterator<Item = &f32> {
        self.layers
            .iter()
            .flat_map(|l| l.weights.iter().chain(l.bias.iter()))
    }

    pub(crate) fn params_mut(&mut self) -> impl Iterator<Item = &mut f32> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.weights.iter_mut().chain(l.bias.iter_mut()))
    }

    pub(crate) fn l2_norm(&self) -> f32 {
        self.params().map(|p| p * p).sum::<f32>().sqrt()
    }

    pub(crate) fn scale(&mut self, factor: f32) {
        for p in self.params_mut() {
            *p *= factor;
        }
    }

    /// Rescale so the global L2 norm is at most `max_norm`. Returns the norm
    /// before clipping.
    pub(crate) fn clip_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.l2_norm();
        if norm > max_norm {
            self.scale(max_norm / (norm + 1e-6));
        }
        norm
    }

    pub fn is_finite(&self) -> bool {
        self.params().all(|p| p.is_finite())
    }
}

fn relu(values: &mut [f32]) {
    for v in values {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}
