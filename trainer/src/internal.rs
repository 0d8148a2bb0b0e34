use log::info;
use machines::{DataBatch, GradientMachine, PassKind, UpdateCallback};
use params::{Parameter, ParameterType};

use crate::{Result, TrainerStats, updater::ParameterUpdater};

#[derive(Clone, Copy, Debug)]
pub struct TrainerInternalConfig {
    /// Accumulate the full gradient into the local gradient sum buffer
    /// instead of letting it pile up for a remote push.
    pub local: bool,
    pub log_period: usize,
}

impl Default for TrainerInternalConfig {
    fn default() -> Self {
        Self {
            local: false,
            log_period: 100,
        }
    }
}

/// Inner loop of variance-reduced training.
///
/// Owns the gradient machine and the updater; the outer pass schedule
/// lives in [`crate::TrainerVR`]. The anchor point w_s sits in each
/// parameter's snapshot buffer and is deep-swapped with the value
/// buffer around the first forward-backward of every batch.
pub struct TrainerInternalVR {
    machine: Box<dyn GradientMachine>,
    updater: Box<dyn ParameterUpdater>,
    stats: TrainerStats,
    config: TrainerInternalConfig,
}

impl TrainerInternalVR {
    pub fn new(
        machine: Box<dyn GradientMachine>,
        updater: Box<dyn ParameterUpdater>,
        config: TrainerInternalConfig,
    ) -> Self {
        Self {
            machine,
            updater,
            stats: TrainerStats::default(),
            config,
        }
    }

    pub fn init(&mut self) -> Result<()> {
        let Self {
            machine, updater, ..
        } = self;
        updater.init(machine.parameters())
    }

    /// One batch of the full-gradient sub-pass. The gradient is left in
    /// place (or folded into the gradient sum when running locally) so
    /// the whole epoch accumulates into one anchor gradient.
    pub fn calc_grad_one_batch(&mut self, batch_id: usize, batch: &DataBatch) {
        if batch.is_empty() {
            return;
        }
        let Self {
            machine,
            stats,
            config,
            ..
        } = self;
        let mut accumulate = |p: &Parameter| {
            p.dense(ParameterType::GradientSum)
                .add(p.dense(ParameterType::Gradient));
            p.clear_gradient();
        };
        let callback: UpdateCallback<'_> = if config.local {
            Some(&mut accumulate)
        } else {
            None
        };
        let cost = machine.forward_backward(batch, PassKind::Train, callback);
        stats.add(batch.len(), cost);
        if (batch_id + 1) % config.log_period == 0 {
            info!("full gradient Batch={} {}", batch_id + 1, stats);
        }
    }

    /// One optimization batch: gradient at the anchor w_s, negate, then
    /// gradient at the current point w_t on top, leaving the
    /// variance-reduced difference for the updater.
    pub fn train_one_batch(&mut self, batch_id: usize, batch: &DataBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let pass = self.updater.start_batch(batch.len());

        self.swap_parameter();
        self.machine.forward_backward(batch, pass, None);
        self.neg_gradients();
        self.swap_parameter();

        let Self {
            machine,
            updater,
            stats,
            config,
        } = self;
        let mut apply = |p: &Parameter| updater.update(p);
        let cost = machine.forward_backward(batch, pass, Some(&mut apply));
        stats.add(batch.len(), cost);
        updater.finish_batch(cost)?;

        if (batch_id + 1) % config.log_period == 0 {
            info!("Batch={} {}", batch_id + 1, stats);
        }
        Ok(())
    }

    pub fn finish_train_pass(&mut self, pass_id: usize, batch_count: usize) -> Result<bool> {
        info!(
            "Pass={} Batch={} {}",
            pass_id,
            batch_count,
            self.stats
        );
        self.updater.finish_pass(self.stats.total_cost())
    }

    /// Deep-swaps the value and snapshot buffers of every parameter.
    pub fn swap_parameter(&mut self) {
        for p in self.machine.parameters() {
            p.dense(ParameterType::Value)
                .swap(p.dense(ParameterType::SnapshotValue));
        }
    }

    pub fn copy_to_snapshot(&mut self) {
        self.copy_parameter(ParameterType::Value, ParameterType::SnapshotValue);
    }

    pub fn copy_from_snapshot(&mut self) {
        self.copy_parameter(ParameterType::SnapshotValue, ParameterType::Value);
    }

    fn copy_parameter(&mut self, from: ParameterType, to: ParameterType) {
        for p in self.machine.parameters() {
            p.dense(to).copy_from(p.dense(from));
        }
    }

    fn neg_gradients(&mut self) {
        for p in self.machine.parameters() {
            p.dense(ParameterType::Gradient).neg();
        }
    }

    pub fn clear_gradients(&mut self, ty: ParameterType) {
        for p in self.machine.parameters() {
            if let Some(buf) = p.try_buf(ty) {
                buf.zero();
            }
        }
    }

    pub fn on_pass_end(&mut self) {
        self.machine.on_pass_end();
    }

    pub fn stats(&self) -> &TrainerStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut TrainerStats {
        &mut self.stats
    }

    pub fn machine(&self) -> &dyn GradientMachine {
        &*self.machine
    }

    pub fn machine_mut(&mut self) -> &mut dyn GradientMachine {
        &mut *self.machine
    }

    pub fn updater_mut(&mut self) -> &mut dyn ParameterUpdater {
        &mut *self.updater
    }
}
