use std::sync::Arc;

use log::info;
use machines::{DataBatch, DataProvider};
use params::ParameterType;

use crate::{Result, TrainerInternalVR};

/// Variance-reduced (SVRG) training loop.
///
/// Every pass runs twice over the data: a full-gradient sub-pass that
/// accumulates the anchor gradient at the snapshot point w_s, then an
/// optimization sub-pass over the same batches in the same order that
/// steps with the variance-reduced gradient estimate.
pub struct TrainerVR {
    internal: TrainerInternalVR,
    provider: Arc<dyn DataProvider>,
    batch_size: usize,
}

impl TrainerVR {
    pub fn new(
        internal: TrainerInternalVR,
        provider: Arc<dyn DataProvider>,
        batch_size: usize,
    ) -> Self {
        Self {
            internal,
            provider,
            batch_size,
        }
    }

    pub fn train(&mut self, num_passes: usize) -> Result<()> {
        self.provider.reset();
        self.internal.copy_to_snapshot();

        for pass_id in 0..num_passes {
            self.internal.clear_gradients(ParameterType::GradientSum);
            self.internal.clear_gradients(ParameterType::Gradient);
            self.calculate_full_gradient(pass_id)?;

            // replay the same epoch for the optimization sub-pass
            self.provider.set_skip_shuffle();
            self.provider.reset();
            self.internal.clear_gradients(ParameterType::Gradient);
            self.internal.copy_from_snapshot();
            self.train_one_pass(pass_id)?;

            if pass_id + 1 < num_passes {
                self.provider.reset();
            }
            self.internal.copy_to_snapshot();
        }
        Ok(())
    }

    /// Accumulates the epoch gradient at w_s and ships it through the
    /// updater as batch 0.
    fn calculate_full_gradient(&mut self, pass_id: usize) -> Result<()> {
        self.internal.stats_mut().reset();
        self.internal.updater_mut().start_pass();
        self.internal.updater_mut().start_batch(0);

        let mut batch = DataBatch::default();
        let mut batch_id = 0;
        while self.provider.next_batch(self.batch_size, &mut batch) > 0 {
            self.internal.calc_grad_one_batch(batch_id, &batch);
            batch_id += 1;
        }
        self.internal.on_pass_end();
        self.internal.updater_mut().finish_batch(0.0)?;

        info!("full gradient Pass={} {}", pass_id, self.internal.stats());
        Ok(())
    }

    fn train_one_pass(&mut self, pass_id: usize) -> Result<()> {
        self.internal.stats_mut().reset();
        self.internal.updater_mut().start_pass();

        let mut batch = DataBatch::default();
        let mut batch_id = 0;
        while self.provider.next_batch(self.batch_size, &mut batch) > 0 {
            self.internal.train_one_batch(batch_id, &batch)?;
            batch_id += 1;
        }
        self.internal.on_pass_end();
        if batch_id == 0 {
            return Ok(());
        }
        self.internal.finish_train_pass(pass_id, batch_id)?;
        Ok(())
    }

    pub fn internal(&self) -> &TrainerInternalVR {
        &self.internal
    }

    pub fn internal_mut(&mut self) -> &mut TrainerInternalVR {
        &mut self.internal
    }
}
