use serde::{Deserialize, Serialize};

use crate::network::QNetwork;

/// Adam with bias correction. Moments follow the network's flat parameter order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: u64,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    pub fn new(lr: f64, param_count: usize) -> Self {
        Self {
            lr: lr as f32,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: vec![0.0; param_count],
            v: vec![0.0; param_count],
        }
    }

    pub fn param_count(&self) -> usize {
        self.m.len()
    }

    /// Updates applied so far.
    pub fn steps(&self) -> u64 {
        self.t
    }

    pub fn step(&mut self, net: &mut QNetwork, grads: &QNetwork) {
        self.t += 1;
        let t = self.t as f32;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);
        let (b1, b2, lr, eps) = (self.beta1, self.beta2, self.lr, self.eps);

        let moments = self.m.iter_mut().zip(self.v.iter_mut());
        for ((p, g), (m, v)) in net.params_mut().zip(grads.params()).zip(moments) {
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        }
    }
}
