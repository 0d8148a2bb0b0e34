use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};
use pserver::{Op, PServerVector, ParameterClient, PreparedOperations};

use crate::{
    OptimizationConfig, Result,
    history::{Correction, LbfgsHistory},
};

/// Orthant-Wise Limited-memory Quasi-Newton optimizer.
///
/// Runs on the controller client; every piece of vector algebra is a
/// batched server-side operation, so the optimizer never holds vector
/// data itself, only handles. One outer iteration per trainer pass:
/// wait for the aggregated gradient, test the weak Wolfe condition,
/// either shift the L-BFGS history and compute a fresh direction or
/// back the step off, then send the next point back to the blocked
/// trainer.
pub struct Owlqn {
    client: ParameterClient,
    steepest_desc_dir: PServerVector,
    dir: PServerVector,
    x: PServerVector,
    newx: PServerVector,
    grad: PServerVector,
    newgrad: PServerVector,
    internal_x: PServerVector,
    internal_grad: PServerVector,
    history: LbfgsHistory,
    alphas: Vec<f32>,
    l1weight: f32,
    l2weight: f32,
    l2weight_backup: f32,
    l2weight_zero_iter: u32,
    c1: f32,
    backoff: f32,
    max_backoff: u32,
    /// Accepted steps so far; drives the l2 annealing.
    internal_iter: u32,
    pass_count: usize,
    expected_pass_count: usize,
}

impl Owlqn {
    /// Creates the optimizer and its working vectors on the server.
    pub fn new(
        client: ParameterClient,
        config: &OptimizationConfig,
        expected_pass_count: usize,
    ) -> Self {
        let internal_x = client.value_vector();
        let internal_grad = client.gradient_vector();
        Self {
            steepest_desc_dir: client.create_vector(),
            dir: client.create_vector(),
            x: client.create_vector(),
            newx: client.create_vector(),
            grad: client.create_vector(),
            newgrad: client.create_vector(),
            internal_x,
            internal_grad,
            history: LbfgsHistory::new(config.owlqn_steps),
            alphas: vec![0.0; config.owlqn_steps],
            l1weight: config.l1weight,
            l2weight: config.l2weight,
            l2weight_backup: config.l2weight,
            l2weight_zero_iter: config.l2weight_zero_iter,
            c1: config.c1,
            backoff: config.backoff,
            max_backoff: config.max_backoff,
            internal_iter: 0,
            pass_count: 0,
            expected_pass_count,
            client,
        }
    }

    /// Releases every server vector this instance created.
    pub fn deinit(self) -> Result<()> {
        for v in [
            self.steepest_desc_dir,
            self.dir,
            self.x,
            self.newx,
            self.grad,
            self.newgrad,
        ] {
            self.client.release_vector(v)?;
        }
        for v in self.history.handles() {
            self.client.release_vector(v)?;
        }
        Ok(())
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Runs exactly `expected_pass_count` outer iterations, storing
    /// each pass's acceptance in `accepted` for the trainer side.
    ///
    /// # Panics
    /// If a computed direction is not a descent direction; continuing
    /// would not reduce the objective.
    pub fn train(&mut self, accepted: &AtomicBool) -> Result<()> {
        let mut step = 1.0f32;
        let mut oldobj = 0.0f32;
        let mut orig_dir_deriv = 0.0f32;
        let mut always_backoff_count = 0u32;
        let mut isiter0 = true;

        while self.pass_count < self.expected_pass_count {
            self.pass_count += 1;
            self.wait_gradient()?;
            if isiter0 {
                self.client.vector_copy(self.internal_x, self.x)?;
                self.client.vector_copy(self.internal_x, self.newx)?;
                // wait_gradient consumed the round and zeroed the shared
                // gradient; the live copy is already in newgrad
                self.client.vector_copy(self.newgrad, self.grad)?;
            }

            let newobj = self.get_cost()?;
            info!(objective_value = newobj; "pass objective");

            let need_new_dir;
            if isiter0 {
                // always accept the starting point
                oldobj = newobj;
                need_new_dir = true;
                accepted.store(true, Ordering::Relaxed);
            } else {
                let wolfe_ok = always_backoff_count == self.max_backoff
                    || newobj <= oldobj + self.c1 * orig_dir_deriv * step;
                info!(wolfe_ok; "wolfe condition test");
                accepted.store(wolfe_ok, Ordering::Relaxed);
                if wolfe_ok {
                    oldobj = newobj;
                    always_backoff_count = 0;
                    self.shift()?;
                    need_new_dir = true;
                } else {
                    // smaller step along the same direction
                    always_backoff_count += 1;
                    step *= self.backoff;
                    need_new_dir = false;
                }
            }

            if need_new_dir {
                step = 1.0;
                self.update_dir()?;
                orig_dir_deriv = self.dir_deriv()?;
                if orig_dir_deriv >= 0.0 {
                    error!(dir_deriv = orig_dir_deriv; "non-descent direction");
                    panic!("check your gradient");
                }
            }

            self.get_next_point(isiter0, &mut step)?;
            self.send_back_new_value()?;
            isiter0 = false;
        }
        Ok(())
    }

    /// Blocks for the trainers' aggregated gradient and copies it into
    /// the working gradient vector.
    fn wait_gradient(&self) -> Result<()> {
        let mut ops = PreparedOperations::new();
        ops.add(Op::Copy {
            src: self.internal_grad,
            dst: self.newgrad,
        });
        self.client.do_operation(&ops, true, false, false)?;
        Ok(())
    }

    /// Pushes the next point to the parameter value vector, releasing
    /// the blocked trainer.
    fn send_back_new_value(&self) -> Result<()> {
        let mut ops = PreparedOperations::new();
        ops.add(Op::Copy {
            src: self.newx,
            dst: self.internal_x,
        });
        self.client.do_operation(&ops, false, true, false)?;
        Ok(())
    }

    /// The regularized objective: accumulated trainer cost plus l1/l2
    /// penalties, with the l2 term folded into the new gradient.
    fn get_cost(&self) -> Result<f32> {
        let mut ops = PreparedOperations::new();
        ops.add(Op::Cost {
            x: self.x,
            grad: self.newgrad,
            l1: self.l1weight,
            l2: self.l2weight,
        });
        let results = self.client.do_operation(&ops, false, false, false)?;
        Ok(results.scalar(0))
    }

    /// Pushes (s, y, ro) into the history and swaps the accepted point
    /// into x/grad.
    fn shift(&mut self) -> Result<()> {
        self.internal_iter += 1;
        if self.l2weight_zero_iter > 0 {
            self.l2weight = if self.internal_iter >= self.l2weight_zero_iter {
                0.0
            } else {
                self.l2weight_backup
                    * (1.0 - self.internal_iter as f32 / self.l2weight_zero_iter as f32)
            };
            info!(internal_iter = self.internal_iter, l2weight = self.l2weight; "l2 annealed");
        }

        let (s, y) = match self.history.evict_for_push() {
            Some(handles) => handles,
            None => (self.client.create_vector(), self.client.create_vector()),
        };
        self.client.vector_add_mult_into(s, self.newx, self.x, -1.0)?;
        self.client
            .vector_add_mult_into(y, self.newgrad, self.grad, -1.0)?;
        let ro = self.client.vector_dot_product(s, y)?;
        self.history.push(Correction { s, y, ro });

        std::mem::swap(&mut self.x, &mut self.newx);
        std::mem::swap(&mut self.grad, &mut self.newgrad);
        Ok(())
    }

    fn update_dir(&mut self) -> Result<()> {
        self.make_steepest_desc_dir()?;
        self.map_dir_by_inverse_hessian()?;
        self.fix_dir_signs()?;
        Ok(())
    }

    fn make_steepest_desc_dir(&self) -> Result<()> {
        if self.l1weight == 0.0 {
            self.client.vector_scale_into(self.dir, self.grad, -1.0)?;
        } else {
            let mut ops = PreparedOperations::new();
            ops.add(Op::MakeSteepestDescDir {
                dir: self.dir,
                grad: self.grad,
                x: self.x,
                l1: self.l1weight,
            });
            self.client.do_operation(&ops, false, false, false)?;
        }
        self.client.vector_copy(self.dir, self.steepest_desc_dir)?;
        Ok(())
    }

    /// Two-loop recursion over the correction history.
    fn map_dir_by_inverse_hessian(&mut self) -> Result<()> {
        let count = self.history.len();
        if count == 0 {
            return Ok(());
        }
        for i in (0..count).rev() {
            let c = self.history.get(i);
            let result = self.client.vector_dot_product(c.s, self.dir)?;
            self.alphas[i] = -result / c.ro;
            self.client.vector_add_mult(self.dir, c.y, self.alphas[i])?;
        }

        let last = self.history.get(count - 1);
        let y_dot_y = self.client.vector_dot_product(last.y, last.y)?;
        self.client.vector_scale(self.dir, last.ro / y_dot_y)?;

        for i in 0..count {
            let c = self.history.get(i);
            let beta = self.client.vector_dot_product(c.y, self.dir)? / c.ro;
            self.client
                .vector_add_mult(self.dir, c.s, -self.alphas[i] - beta)?;
        }
        Ok(())
    }

    /// Zeroes direction components disagreeing with the steepest
    /// descent direction (l1 orthant constraint).
    fn fix_dir_signs(&self) -> Result<()> {
        if self.l1weight > 0.0 {
            let mut ops = PreparedOperations::new();
            ops.add(Op::FixDirSigns {
                dir: self.dir,
                steepest: self.steepest_desc_dir,
            });
            self.client.do_operation(&ops, false, false, false)?;
        }
        Ok(())
    }

    /// Projects the new point back onto x's orthant.
    fn fix_omega_signs(&self) -> Result<()> {
        if self.l1weight > 0.0 {
            let mut ops = PreparedOperations::new();
            ops.add(Op::FixOmegaSigns {
                newx: self.newx,
                x: self.x,
            });
            self.client.do_operation(&ops, false, false, false)?;
        }
        Ok(())
    }

    fn dir_deriv(&self) -> Result<f32> {
        let deriv = if self.l1weight == 0.0 {
            self.client.vector_dot_product(self.dir, self.grad)?
        } else {
            let mut ops = PreparedOperations::new();
            ops.add(Op::DirDeriv {
                dir: self.dir,
                grad: self.grad,
                x: self.x,
                l1: self.l1weight,
            });
            self.client.do_operation(&ops, false, false, false)?.scalar(0)
        };
        info!(dir_deriv = deriv; "direction derivative");
        Ok(deriv)
    }

    /// `newx = x + step * dir`, with the step normalized by `1/|dir|`
    /// on the first iteration.
    fn get_next_point(&self, isiter0: bool, step: &mut f32) -> Result<()> {
        if isiter0 {
            let norm = self.client.vector_dot_product(self.dir, self.dir)?.sqrt();
            *step = 1.0 / norm;
        }
        info!(step = *step; "line search step");
        self.client
            .vector_add_mult_into(self.newx, self.x, self.dir, *step)?;
        self.fix_omega_signs()?;
        Ok(())
    }
}
