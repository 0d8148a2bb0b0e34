use std::sync::Arc;

use log::info;
use machines::{BatchGradientMachine, DataProvider};

use crate::{
    BatchRemoteParameterUpdater, Result, TrainerStats, updater::ParameterUpdater,
};

/// Full-batch OWLQN training loop.
///
/// Each pass runs the worker pool over the whole epoch, then hands the
/// reduced gradient sum to the optimizer through the updater and
/// applies the point it sends back. Rejected passes re-evaluate the
/// objective at a backed-off step along the same direction.
pub struct OwlqnTrainer {
    machine: BatchGradientMachine,
    updater: BatchRemoteParameterUpdater,
    provider: Arc<dyn DataProvider>,
    stats: TrainerStats,
}

impl OwlqnTrainer {
    pub fn new(
        machine: BatchGradientMachine,
        mut updater: BatchRemoteParameterUpdater,
        provider: Arc<dyn DataProvider>,
    ) -> Result<Self> {
        updater.init(machine.parameters())?;
        Ok(Self {
            machine,
            updater,
            provider,
            stats: TrainerStats::default(),
        })
    }

    pub fn train(&mut self, num_passes: usize) -> Result<()> {
        for pass_id in 0..num_passes {
            self.provider.reset();
            self.machine.clear_gradient_sum();
            self.updater.start_pass();

            let pass = self.machine.train_pass();
            self.stats.reset_current();
            self.stats.add(pass.samples, pass.cost);

            let accepted = self.updater.finish_pass(pass.cost)?;
            info!(
                "Pass={} accepted={} {}",
                pass_id, accepted, self.stats
            );
        }
        Ok(())
    }

    pub fn stats(&self) -> &TrainerStats {
        &self.stats
    }

    /// Main-replica parameters; the value buffer holds the last point
    /// the optimizer sent back.
    pub fn parameters(&self) -> &[params::Parameter] {
        self.machine.parameters()
    }

    /// Stops the worker pool and joins the optimizer thread.
    pub fn finish(self) -> Result<()> {
        let Self {
            machine,
            mut updater,
            ..
        } = self;
        machine.finish();
        updater.deinit();
        Ok(())
    }
}
