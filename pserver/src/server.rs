use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::{
    Op, OpResults, PreparedOperations, PsError, Result, math, vector::PServerVector,
};

/// Built-in vector handles, never released.
const VALUE: PServerVector = PServerVector(0);
const GRADIENT: PServerVector = PServerVector(1);
const GRADIENT_SUM: PServerVector = PServerVector(2);
const NUM_RESERVED: usize = 3;

/// Server lifecycle status, used to gate trainer startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Init,
    ParameterReady,
}

/// How `send_and_receive_parameter` interprets its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    /// Accumulate the payload into the server gradient.
    AddGradient,
    /// Overwrite the server value (initial upload).
    SetParam,
}

/// Server-side optimization settings.
#[derive(Clone, Copy, Debug)]
pub struct ServerOptConfig {
    pub learning_rate: f32,
}

struct ServerState {
    vectors: Vec<Option<Vec<f32>>>,
    free: Vec<u32>,
    accumulated_cost: f64,
    /// Gradient contributions since the last consuming op batch.
    pending_grads: usize,
    /// Bumped by op batches with send_back_parameter, releasing senders.
    send_back_gen: u64,
    pass_start_gen: u64,
    pass_finish_gen: u64,
    /// Data clients currently blocked in wait_pass_start.
    start_waiters: usize,
    /// Data clients that requested the pass finish.
    finish_requested: usize,
    status: Status,
    learning_rate: f32,
}

impl ServerState {
    fn vec(&self, v: PServerVector) -> Result<&[f32]> {
        self.vectors
            .get(v.index())
            .and_then(|slot| slot.as_deref())
            .ok_or(PsError::InvalidVector(v.0))
    }

    fn take(&mut self, v: PServerVector) -> Result<Vec<f32>> {
        self.vectors
            .get_mut(v.index())
            .and_then(Option::take)
            .ok_or(PsError::InvalidVector(v.0))
    }

    fn put(&mut self, v: PServerVector, data: Vec<f32>) {
        self.vectors[v.index()] = Some(data);
    }

    fn finish_pass(&mut self) {
        self.pass_finish_gen += 1;
        self.finish_requested = 0;
    }
}

/// The in-process parameter server.
///
/// One mutex guards the whole state, so op batches are applied
/// atomically and in submission order per vector; blocking calls wait
/// on a single condvar.
pub struct ParameterServer {
    dim: usize,
    num_trainers: usize,
    state: Mutex<ServerState>,
    cond: Condvar,
}

impl ParameterServer {
    /// Creates a server holding `dim`-sized vectors, expecting gradient
    /// contributions from `num_trainers` data clients per round.
    pub fn new(dim: usize, num_trainers: usize, opt: ServerOptConfig) -> Self {
        assert!(num_trainers > 0, "num_trainers must be positive");
        let vectors = (0..NUM_RESERVED).map(|_| Some(vec![0.0; dim])).collect();
        Self {
            dim,
            num_trainers,
            state: Mutex::new(ServerState {
                vectors,
                free: Vec::new(),
                accumulated_cost: 0.0,
                pending_grads: 0,
                send_back_gen: 0,
                pass_start_gen: 0,
                pass_finish_gen: 0,
                start_waiters: 0,
                finish_requested: 0,
                status: Status::Init,
                learning_rate: opt.learning_rate,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_trainers(&self) -> usize {
        self.num_trainers
    }

    /// The built-in parameter value vector.
    pub fn value_vector(&self) -> PServerVector {
        VALUE
    }

    /// The built-in aggregated gradient vector.
    pub fn gradient_vector(&self) -> PServerVector {
        GRADIENT
    }

    /// The built-in gradient-sum (variance-reduction anchor) vector.
    pub fn gradient_sum_vector(&self) -> PServerVector {
        GRADIENT_SUM
    }

    pub(crate) fn create_vector(&self) -> PServerVector {
        let mut st = self.state.lock();
        match st.free.pop() {
            Some(idx) => {
                st.vectors[idx as usize] = Some(vec![0.0; self.dim]);
                PServerVector(idx)
            }
            None => {
                st.vectors.push(Some(vec![0.0; self.dim]));
                PServerVector((st.vectors.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn release_vector(&self, v: PServerVector) -> Result<()> {
        if v.index() < NUM_RESERVED {
            return Err(PsError::ReservedVector(v.0));
        }
        let mut st = self.state.lock();
        let slot = st
            .vectors
            .get_mut(v.index())
            .ok_or(PsError::InvalidVector(v.0))?;
        if slot.take().is_none() {
            return Err(PsError::InvalidVector(v.0));
        }
        st.free.push(v.0);
        Ok(())
    }

    /// Applies one op batch.
    ///
    /// With `wait_for_gradient` the batch blocks until every data client
    /// contributed this round (a pass-finish request counts as a final,
    /// empty contribution), then consumes the round: the gradient vector
    /// is zeroed and the contribution count reset. `send_back_parameter`
    /// releases senders blocked for the updated value; `release_pass`
    /// closes the pass.
    pub(crate) fn do_operation(
        &self,
        ops: &PreparedOperations,
        wait_for_gradient: bool,
        send_back_parameter: bool,
        release_pass: bool,
    ) -> Result<OpResults> {
        let mut st = self.state.lock();
        if wait_for_gradient {
            while st.pending_grads + st.finish_requested < self.num_trainers {
                self.cond.wait(&mut st);
            }
        }
        let had_grads = st.pending_grads > 0;

        let mut results = OpResults::default();
        for op in ops.ops() {
            self.exec(&mut st, *op, had_grads, &mut results)?;
        }

        if wait_for_gradient {
            let mut grad = st.take(GRADIENT)?;
            math::reset(&mut grad, 0.0);
            st.put(GRADIENT, grad);
            st.pending_grads = 0;
        }
        if send_back_parameter {
            st.send_back_gen += 1;
        }
        if release_pass {
            st.finish_pass();
        }
        self.cond.notify_all();
        Ok(results)
    }

    fn exec(
        &self,
        st: &mut ServerState,
        op: Op,
        had_grads: bool,
        results: &mut OpResults,
    ) -> Result<()> {
        match op {
            Op::Reset(v, value) => {
                let mut data = st.take(v)?;
                math::reset(&mut data, value);
                st.put(v, data);
            }
            Op::Copy { src, dst } => {
                if src != dst {
                    let mut d = st.take(dst)?;
                    math::copy(&mut d, st.vec(src)?);
                    st.put(dst, d);
                }
            }
            Op::CopyZero { src, dst } => {
                let mut d = st.take(dst)?;
                let mut s = st.take(src)?;
                math::copy(&mut d, &s);
                math::reset(&mut s, 0.0);
                st.put(dst, d);
                st.put(src, s);
            }
            Op::Scale(v, k) => {
                let mut data = st.take(v)?;
                math::scale(&mut data, k);
                st.put(v, data);
            }
            Op::ScaleInto { dst, src, k } => {
                let mut d = st.take(dst)?;
                math::scale_into(&mut d, st.vec(src)?, k);
                st.put(dst, d);
            }
            Op::AddMult { dst, src, k } => {
                let mut d = st.take(dst)?;
                math::add_mult(&mut d, st.vec(src)?, k);
                st.put(dst, d);
            }
            Op::AddMultInto { dst, a, b, k } => {
                let mut d = st.take(dst)?;
                math::add_mult_into(&mut d, st.vec(a)?, st.vec(b)?, k);
                st.put(dst, d);
            }
            Op::DotProduct(a, b) => {
                let r = math::dot(st.vec(a)?, st.vec(b)?);
                results.push(r as f32);
            }
            Op::Cost { x, grad, l1, l2 } => {
                let base = st.accumulated_cost;
                st.accumulated_cost = 0.0;
                let mut g = st.take(grad)?;
                let c = math::cost(st.vec(x)?, &mut g, l1, l2, base);
                st.put(grad, g);
                results.push(c as f32);
            }
            Op::MakeSteepestDescDir { dir, grad, x, l1 } => {
                let mut d = st.take(dir)?;
                math::make_steepest_desc_dir(&mut d, st.vec(grad)?, st.vec(x)?, l1);
                st.put(dir, d);
            }
            Op::FixDirSigns { dir, steepest } => {
                let mut d = st.take(dir)?;
                math::fix_dir_signs(&mut d, st.vec(steepest)?);
                st.put(dir, d);
            }
            Op::FixOmegaSigns { newx, x } => {
                let mut n = st.take(newx)?;
                math::fix_omega_signs(&mut n, st.vec(x)?);
                st.put(newx, n);
            }
            Op::DirDeriv { dir, grad, x, l1 } => {
                let r = math::dir_deriv(st.vec(dir)?, st.vec(grad)?, st.vec(x)?, l1);
                results.push(r as f32);
            }
            Op::Sgd => {
                // a round released purely by pass-finish requests carries
                // no gradient; applying the anchor alone would corrupt w
                if had_grads {
                    let lr = st.learning_rate;
                    let mut value = st.take(VALUE)?;
                    math::sgd(&mut value, st.vec(GRADIENT)?, st.vec(GRADIENT_SUM)?, lr);
                    st.put(VALUE, value);
                }
            }
            Op::StartPass => {
                st.pass_start_gen += 1;
            }
            Op::FinishPass => {
                st.finish_pass();
            }
        }
        Ok(())
    }

    /// Data-plane exchange: pushes a payload and optionally blocks until
    /// an op batch with `send_back_parameter` ran, returning the value.
    pub(crate) fn send_and_receive(
        &self,
        mode: UpdateMode,
        data: &[f32],
        batch_size: usize,
        cost: f32,
        send_back: bool,
    ) -> Result<Option<Vec<f32>>> {
        if data.len() != self.dim {
            return Err(PsError::DimMismatch {
                got: data.len(),
                expected: self.dim,
            });
        }
        let mut st = self.state.lock();
        match mode {
            UpdateMode::AddGradient => {
                debug!(batch_size; "gradient contribution");
                let mut grad = st.take(GRADIENT)?;
                math::add_mult(&mut grad, data, 1.0);
                st.put(GRADIENT, grad);
                st.accumulated_cost += cost as f64;
                st.pending_grads += 1;
            }
            UpdateMode::SetParam => {
                let mut value = st.take(VALUE)?;
                math::copy(&mut value, data);
                st.put(VALUE, value);
            }
        }
        self.cond.notify_all();

        if !send_back {
            return Ok(None);
        }
        let entry = st.send_back_gen;
        while st.send_back_gen == entry {
            self.cond.wait(&mut st);
        }
        Ok(Some(st.vec(VALUE)?.to_vec()))
    }

    pub(crate) fn get_parameter(&self) -> Result<Vec<f32>> {
        let st = self.state.lock();
        Ok(st.vec(VALUE)?.to_vec())
    }

    /// Blocks a data client until the next StartPass op.
    pub(crate) fn wait_pass_start_trainer(&self) {
        let mut st = self.state.lock();
        st.start_waiters += 1;
        self.cond.notify_all();
        let entry = st.pass_start_gen;
        while st.pass_start_gen == entry {
            self.cond.wait(&mut st);
        }
        st.start_waiters -= 1;
        self.cond.notify_all();
    }

    /// Blocks the controller until every data client is parked at the
    /// pass boundary.
    pub(crate) fn wait_pass_start_controller(&self) {
        let mut st = self.state.lock();
        while st.start_waiters < self.num_trainers {
            self.cond.wait(&mut st);
        }
    }

    /// Requests the pass finish and blocks until a FinishPass op ran.
    pub(crate) fn wait_pass_finish(&self) {
        let mut st = self.state.lock();
        st.finish_requested += 1;
        self.cond.notify_all();
        let entry = st.pass_finish_gen;
        while st.pass_finish_gen == entry {
            self.cond.wait(&mut st);
        }
    }

    pub(crate) fn is_pass_finish(&self) -> bool {
        let st = self.state.lock();
        st.finish_requested >= self.num_trainers && st.pending_grads == 0
    }

    pub(crate) fn set_status(&self, status: Status) {
        let mut st = self.state.lock();
        st.status = status;
        self.cond.notify_all();
    }

    pub(crate) fn wait_for_status(&self, status: Status) {
        let mut st = self.state.lock();
        while st.status != status {
            self.cond.wait(&mut st);
        }
    }
}
