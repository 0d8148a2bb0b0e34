use crate::buffer::{AtomicBuf, Buffer, DenseBuf, IntBuf, SparseRowBuf};

/// The purpose of a parameter buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterType {
    Value,
    Gradient,
    GradientSum,
    SnapshotValue,
    Momentum,
    LearningRate,
}

pub const NUM_PARAMETER_TYPES: usize = 6;

impl ParameterType {
    fn index(self) -> usize {
        match self {
            ParameterType::Value => 0,
            ParameterType::Gradient => 1,
            ParameterType::GradientSum => 2,
            ParameterType::SnapshotValue => 3,
            ParameterType::Momentum => 4,
            ParameterType::LearningRate => 5,
        }
    }
}

/// Shape and update semantics of one parameter, fixed by the model
/// configuration.
#[derive(Clone, Debug)]
pub struct ParameterConfig {
    pub height: usize,
    pub width: usize,
    /// Gradients are row-indexed and updates touch only the rows seen in
    /// the mini-batch.
    pub sparse_update: bool,
    /// Static parameters are never updated.
    pub is_static: bool,
}

impl ParameterConfig {
    pub fn dense(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            sparse_update: false,
            is_static: false,
        }
    }

    pub fn sparse(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            sparse_update: true,
            is_static: false,
        }
    }

    pub fn size(&self) -> usize {
        self.height * self.width
    }
}

/// A named, ID-indexed weight tensor with purpose-tagged buffers.
///
/// Which buffer types exist is decided once at initialization and never
/// changes during a pass. Clones alias the same underlying storage: a
/// slave replica enabling a shared VALUE holds the very buffer the main
/// replica owns.
#[derive(Clone, Debug)]
pub struct Parameter {
    id: usize,
    name: String,
    config: ParameterConfig,
    bufs: [Option<Buffer>; NUM_PARAMETER_TYPES],
    update_time: Option<IntBuf>,
}

impl Parameter {
    pub fn new(id: usize, name: impl Into<String>, config: ParameterConfig) -> Self {
        Self {
            id,
            name: name.into(),
            config,
            bufs: Default::default(),
            update_time: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ParameterConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.config.size()
    }

    pub fn is_static(&self) -> bool {
        self.config.is_static
    }

    pub fn is_sparse_update(&self) -> bool {
        self.config.sparse_update
    }

    /// Enables `ty` as a fresh zero-filled dense buffer.
    pub fn enable(&mut self, ty: ParameterType) {
        self.set_buf(ty, Buffer::Dense(DenseBuf::zeros(self.size())));
    }

    /// Enables `ty` as a fresh lock-free shared buffer (async-SGD path).
    pub fn enable_atomic(&mut self, ty: ParameterType) {
        self.set_buf(ty, Buffer::Atomic(AtomicBuf::zeros(self.size())));
    }

    /// Enables `ty` as row-indexed sparse gradient storage.
    pub fn enable_sparse_row(&mut self, ty: ParameterType) {
        self.set_buf(ty, Buffer::SparseRow(SparseRowBuf::new(self.config.width)));
    }

    /// Enables `ty` as an alias of an existing buffer (shared view).
    pub fn enable_shared(&mut self, ty: ParameterType, buf: Buffer) {
        self.set_buf(ty, buf);
    }

    /// Enables the per-row update-timestamp buffer.
    pub fn enable_update_time(&mut self) {
        assert!(self.update_time.is_none(), "update time enabled twice");
        self.update_time = Some(IntBuf::zeros(self.config.height));
    }

    fn set_buf(&mut self, ty: ParameterType, buf: Buffer) {
        let slot = &mut self.bufs[ty.index()];
        assert!(
            slot.is_none(),
            "buffer {ty:?} enabled twice for parameter {}",
            self.name
        );
        *slot = Some(buf);
    }

    pub fn is_enabled(&self, ty: ParameterType) -> bool {
        self.bufs[ty.index()].is_some()
    }

    pub fn try_buf(&self, ty: ParameterType) -> Option<&Buffer> {
        self.bufs[ty.index()].as_ref()
    }

    /// # Panics
    /// If `ty` was not enabled; buffer presence is an init-time invariant.
    pub fn buf(&self, ty: ParameterType) -> &Buffer {
        self.try_buf(ty)
            .unwrap_or_else(|| panic!("buffer {ty:?} not enabled for parameter {}", self.name))
    }

    /// # Panics
    /// If `ty` is missing or not dense.
    pub fn dense(&self, ty: ParameterType) -> &DenseBuf {
        self.buf(ty)
            .as_dense()
            .unwrap_or_else(|| panic!("buffer {ty:?} of parameter {} is not dense", self.name))
    }

    pub fn update_time(&self) -> Option<&IntBuf> {
        self.update_time.as_ref()
    }

    /// Zeroes the gradient buffer.
    pub fn clear_gradient(&self) {
        self.buf(ParameterType::Gradient).zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_set_is_fixed_and_shared() {
        let mut main = Parameter::new(0, "w", ParameterConfig::dense(2, 3));
        main.enable(ParameterType::Value);
        main.enable(ParameterType::Gradient);

        assert!(main.is_enabled(ParameterType::Value));
        assert!(!main.is_enabled(ParameterType::GradientSum));

        // slave replica: shared VALUE view, private gradient
        let mut slave = Parameter::new(0, "w", ParameterConfig::dense(2, 3));
        slave.enable_shared(ParameterType::Value, main.buf(ParameterType::Value).clone());
        slave.enable(ParameterType::Gradient);

        main.dense(ParameterType::Value).fill(7.0);
        assert_eq!(slave.dense(ParameterType::Value).to_vec(), [7.0; 6]);

        slave.dense(ParameterType::Gradient).fill(1.0);
        assert_eq!(main.dense(ParameterType::Gradient).to_vec(), [0.0; 6]);
    }

    #[test]
    #[should_panic(expected = "not enabled")]
    fn missing_buffer_is_fatal() {
        let p = Parameter::new(0, "w", ParameterConfig::dense(1, 1));
        let _ = p.buf(ParameterType::Momentum);
    }

    #[test]
    #[should_panic(expected = "enabled twice")]
    fn double_enable_is_fatal() {
        let mut p = Parameter::new(0, "w", ParameterConfig::dense(1, 1));
        p.enable(ParameterType::Value);
        p.enable(ParameterType::Value);
    }

    #[test]
    fn sparse_parameter_buffers() {
        let mut p = Parameter::new(1, "emb", ParameterConfig::sparse(4, 2));
        p.enable_atomic(ParameterType::Value);
        p.enable_sparse_row(ParameterType::Gradient);
        p.enable_update_time();

        assert_eq!(p.update_time().unwrap().len(), 4);
        let grad = p.buf(ParameterType::Gradient).as_sparse_row().unwrap();
        grad.add_row(2, &[1.0, -1.0]);
        assert_eq!(grad.num_rows(), 1);

        p.clear_gradient();
        assert_eq!(grad.num_rows(), 0);
    }
}
