use params::Parameter;

use crate::data::DataBatch;

/// Whether a pass trains or only evaluates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    Train,
    Test,
}

/// Invoked for each parameter once its gradient for the batch is
/// complete, so an updater can apply or ship it immediately.
pub type UpdateCallback<'a> = Option<&'a mut dyn FnMut(&Parameter)>;

/// A network replica that can compute costs and gradients.
///
/// Gradients accumulate into the parameters' GRADIENT buffers across
/// batches; the owner decides when to consume and clear them.
pub trait GradientMachine: Send {
    /// Runs the forward computation and returns the batch cost
    /// (summed over instances, not averaged).
    fn forward(&mut self, batch: &DataBatch, pass: PassKind) -> f64;

    /// Accumulates gradients for the most recent forward.
    fn backward(&mut self, callback: UpdateCallback<'_>);

    fn forward_backward(
        &mut self,
        batch: &DataBatch,
        pass: PassKind,
        callback: UpdateCallback<'_>,
    ) -> f64 {
        let cost = self.forward(batch, pass);
        self.backward(callback);
        cost
    }

    fn parameters(&self) -> &[Parameter];

    fn on_pass_end(&mut self) {}
}

/// Builds network replicas for a worker pool.
///
/// Called with `None` for the main replica; slave replicas receive the
/// main replica's parameters and are expected to share its VALUE
/// storage while owning a private GRADIENT.
pub type ReplicaFactory =
    Box<dyn Fn(Option<&[Parameter]>) -> Box<dyn GradientMachine> + Send + Sync>;
