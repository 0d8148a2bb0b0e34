use ndarray::Array2;
use params::{Buffer, Parameter, ParameterConfig, ParameterType};

use crate::{
    data::DataBatch,
    machine::{GradientMachine, PassKind, UpdateCallback},
};

/// A least-squares network with a single weight matrix.
///
/// `cost = 0.5 * ||X W - Y||^2`, `grad = X^T (X W - Y)`, summed over the
/// batch. Small enough to verify optimizer behavior against closed-form
/// gradients, and usable as the replica factory for the worker pools.
pub struct LinearNetwork {
    params: Vec<Parameter>,
    residual: Option<(Array2<f32>, Array2<f32>)>,
}

impl LinearNetwork {
    /// Main replica: owns dense VALUE and GRADIENT buffers.
    pub fn new(height: usize, width: usize) -> Self {
        let mut w = Parameter::new(0, "w", ParameterConfig::dense(height, width));
        w.enable(ParameterType::Value);
        w.enable(ParameterType::Gradient);
        Self::from_parameter(w)
    }

    /// Main replica for the async path: lock-free VALUE and MOMENTUM,
    /// private dense GRADIENT.
    pub fn new_atomic(height: usize, width: usize) -> Self {
        let mut w = Parameter::new(0, "w", ParameterConfig::dense(height, width));
        w.enable_atomic(ParameterType::Value);
        w.enable_atomic(ParameterType::Momentum);
        w.enable(ParameterType::Gradient);
        Self::from_parameter(w)
    }

    /// Slave replica: shares the main replica's VALUE, owns a private
    /// dense GRADIENT.
    pub fn replica(main: &[Parameter]) -> Self {
        let src = &main[0];
        let mut w = Parameter::new(src.id(), src.name(), src.config().clone());
        w.enable_shared(ParameterType::Value, src.buf(ParameterType::Value).clone());
        if let Some(m) = src.try_buf(ParameterType::Momentum) {
            w.enable_shared(ParameterType::Momentum, m.clone());
        }
        w.enable(ParameterType::Gradient);
        Self::from_parameter(w)
    }

    pub fn from_parameter(w: Parameter) -> Self {
        Self {
            params: vec![w],
            residual: None,
        }
    }

    pub fn parameter(&self) -> &Parameter {
        &self.params[0]
    }

    fn weights(&self) -> Array2<f32> {
        let p = &self.params[0];
        let values = match p.buf(ParameterType::Value) {
            Buffer::Dense(b) => b.to_vec(),
            Buffer::Atomic(b) => b.to_vec(),
            Buffer::SparseRow(_) => panic!("dense network over a sparse-row value buffer"),
        };
        let cfg = p.config();
        Array2::from_shape_vec((cfg.height, cfg.width), values)
            .unwrap_or_else(|e| panic!("value buffer shape broken for {}: {e}", p.name()))
    }
}

impl GradientMachine for LinearNetwork {
    fn forward(&mut self, batch: &DataBatch, pass: PassKind) -> f64 {
        let residual = batch.inputs.dot(&self.weights()) - &batch.targets;
        let cost = 0.5 * residual.iter().map(|r| (*r as f64) * (*r as f64)).sum::<f64>();
        self.residual = match pass {
            PassKind::Train => Some((batch.inputs.clone(), residual)),
            PassKind::Test => None,
        };
        cost
    }

    fn backward(&mut self, callback: UpdateCallback<'_>) {
        let (inputs, residual) = self
            .residual
            .take()
            .unwrap_or_else(|| panic!("backward without a preceding train forward"));
        let grad = inputs.t().dot(&residual);
        let p = &self.params[0];
        let flat: Vec<f32> = grad.iter().copied().collect();
        match p.buf(ParameterType::Gradient) {
            Buffer::Dense(b) => b.add_slice(&flat),
            Buffer::Atomic(b) => {
                for (i, g) in flat.iter().enumerate() {
                    b.add(i, *g);
                }
            }
            Buffer::SparseRow(b) => {
                let width = p.config().width;
                for (row, chunk) in flat.chunks(width).enumerate() {
                    b.add_row(row, chunk);
                }
            }
        }
        if let Some(cb) = callback {
            cb(p);
        }
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }
}
