use std::sync::Arc;

use crate::{
    Op, OpResults, PreparedOperations, Result, Status, UpdateMode,
    server::ParameterServer, vector::PServerVector,
};

/// Which side of the training protocol this client speaks.
///
/// Data clients push gradients and park at pass boundaries; the single
/// controller drives op batches and opens/closes passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientRole {
    Trainer,
    Controller,
}

/// Client façade over a [`ParameterServer`].
///
/// Cheap to clone per thread; all state lives on the server.
#[derive(Clone)]
pub struct ParameterClient {
    server: Arc<ParameterServer>,
    role: ClientRole,
}

impl ParameterClient {
    pub fn new(server: Arc<ParameterServer>, role: ClientRole) -> Self {
        Self { server, role }
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn dim(&self) -> usize {
        self.server.dim()
    }

    pub fn num_trainers(&self) -> usize {
        self.server.num_trainers()
    }

    pub fn value_vector(&self) -> PServerVector {
        self.server.value_vector()
    }

    pub fn gradient_vector(&self) -> PServerVector {
        self.server.gradient_vector()
    }

    pub fn gradient_sum_vector(&self) -> PServerVector {
        self.server.gradient_sum_vector()
    }

    /// Allocates a fresh zero vector on the server.
    pub fn create_vector(&self) -> PServerVector {
        self.server.create_vector()
    }

    /// Frees a server vector. The handle must not be used afterwards.
    pub fn release_vector(&self, v: PServerVector) -> Result<()> {
        self.server.release_vector(v)
    }

    /// Submits an op batch.
    ///
    /// # Arguments
    /// * `wait_for_gradient` - block until every data client contributed
    ///   this round, then consume the round
    /// * `send_back_parameter` - release senders blocked for the updated
    ///   value
    /// * `release_pass` - close the current pass
    pub fn do_operation(
        &self,
        ops: &PreparedOperations,
        wait_for_gradient: bool,
        send_back_parameter: bool,
        release_pass: bool,
    ) -> Result<OpResults> {
        self.server
            .do_operation(ops, wait_for_gradient, send_back_parameter, release_pass)
    }

    fn one_op(&self, op: Op) -> Result<OpResults> {
        let mut ops = PreparedOperations::new();
        ops.add(op);
        self.do_operation(&ops, false, false, false)
    }

    /// dst = src
    pub fn vector_copy(&self, src: PServerVector, dst: PServerVector) -> Result<()> {
        self.one_op(Op::Copy { src, dst }).map(|_| ())
    }

    /// v *= k
    pub fn vector_scale(&self, v: PServerVector, k: f32) -> Result<()> {
        self.one_op(Op::Scale(v, k)).map(|_| ())
    }

    /// dst = k * src
    pub fn vector_scale_into(
        &self,
        dst: PServerVector,
        src: PServerVector,
        k: f32,
    ) -> Result<()> {
        self.one_op(Op::ScaleInto { dst, src, k }).map(|_| ())
    }

    /// dst += k * src
    pub fn vector_add_mult(
        &self,
        dst: PServerVector,
        src: PServerVector,
        k: f32,
    ) -> Result<()> {
        self.one_op(Op::AddMult { dst, src, k }).map(|_| ())
    }

    /// dst = a + k * b
    pub fn vector_add_mult_into(
        &self,
        dst: PServerVector,
        a: PServerVector,
        b: PServerVector,
        k: f32,
    ) -> Result<()> {
        self.one_op(Op::AddMultInto { dst, a, b, k }).map(|_| ())
    }

    /// a . b
    pub fn vector_dot_product(&self, a: PServerVector, b: PServerVector) -> Result<f32> {
        self.one_op(Op::DotProduct(a, b)).map(|r| r.scalar(0))
    }

    /// Pushes a local gradient (or the initial value) and optionally
    /// blocks for the updated parameter.
    pub fn send_and_receive_parameter(
        &self,
        mode: UpdateMode,
        data: &[f32],
        batch_size: usize,
        cost: f32,
        send_back: bool,
    ) -> Result<Option<Vec<f32>>> {
        self.server
            .send_and_receive(mode, data, batch_size, cost, send_back)
    }

    /// Overwrites the server value vector.
    pub fn set_parameter(&self, data: &[f32]) -> Result<()> {
        self.server
            .send_and_receive(UpdateMode::SetParam, data, 0, 0.0, false)
            .map(|_| ())
    }

    /// Fetches a copy of the server value vector.
    pub fn get_parameter(&self) -> Result<Vec<f32>> {
        self.server.get_parameter()
    }

    /// Pass-boundary rendezvous.
    ///
    /// A data client parks until the controller opens the pass; the
    /// controller parks until every data client arrived (and then still
    /// has to submit a StartPass op to actually open it).
    pub fn wait_pass_start(&self) {
        match self.role {
            ClientRole::Trainer => self.server.wait_pass_start_trainer(),
            ClientRole::Controller => self.server.wait_pass_start_controller(),
        }
    }

    /// Requests the pass finish and blocks until the controller closes it.
    pub fn wait_pass_finish(&self) {
        self.server.wait_pass_finish();
    }

    /// True once every data client requested the finish and no gradient
    /// round is left to consume.
    pub fn is_pass_finish(&self) -> bool {
        self.server.is_pass_finish()
    }

    pub fn set_status(&self, status: Status) {
        self.server.set_status(status);
    }

    pub fn wait_for_status(&self, status: Status) {
        self.server.wait_for_status(status);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::ServerOptConfig;

    use super::*;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn pair() -> (ParameterClient, ParameterClient) {
        let server = Arc::new(ParameterServer::new(
            4,
            1,
            ServerOptConfig { learning_rate: 0.1 },
        ));
        (
            ParameterClient::new(Arc::clone(&server), ClientRole::Trainer),
            ParameterClient::new(server, ClientRole::Controller),
        )
    }

    #[test]
    fn vector_convenience_ops() {
        let (_, ctl) = pair();
        let a = ctl.create_vector();
        let b = ctl.create_vector();

        ctl.one_op(Op::Reset(a, 1.0)).unwrap();
        ctl.vector_scale_into(b, a, 2.0).unwrap();
        ctl.vector_add_mult(b, a, 1.0).unwrap();
        assert_eq!(ctl.vector_dot_product(a, b).unwrap(), 12.0);

        ctl.vector_copy(b, a).unwrap();
        assert_eq!(ctl.vector_dot_product(a, a).unwrap(), 36.0);

        ctl.release_vector(a).unwrap();
        ctl.release_vector(b).unwrap();
    }

    #[test]
    fn status_gates_trainer_startup() {
        let (tr, ctl) = pair();
        let t = thread::spawn(move || {
            tr.wait_for_status(Status::ParameterReady);
            tr.get_parameter().unwrap()
        });
        ctl.set_parameter(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        ctl.set_status(Status::ParameterReady);
        assert_eq!(t.join().unwrap(), [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn pass_rendezvous_round_trip() {
        init_logs();
        let (tr, ctl) = pair();
        let t = thread::spawn(move || {
            tr.wait_pass_start();
            tr.send_and_receive_parameter(UpdateMode::AddGradient, &[1.0; 4], 2, 0.5, false)
                .unwrap();
            tr.wait_pass_finish();
        });

        ctl.wait_pass_start();
        let mut start = PreparedOperations::new();
        start.add(Op::StartPass);
        ctl.do_operation(&start, false, false, false).unwrap();

        let mut sgd = PreparedOperations::new();
        sgd.add(Op::Sgd);
        while !ctl.is_pass_finish() {
            ctl.do_operation(&sgd, true, true, false).unwrap();
        }
        let mut finish = PreparedOperations::new();
        finish.add(Op::FinishPass);
        ctl.do_operation(&finish, false, true, true).unwrap();
        t.join().unwrap();

        // one sgd step at lr 0.1 over a unit gradient
        let value = ctl.get_parameter().unwrap();
        for v in value {
            assert!((v + 0.1).abs() < 1e-6);
        }
    }
}
