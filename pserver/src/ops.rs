use crate::vector::PServerVector;

/// One server-side operation.
///
/// Ops that produce a scalar push it onto the batch's result list in
/// submission order.
#[derive(Clone, Copy, Debug)]
pub enum Op {
    /// v = value
    Reset(PServerVector, f32),
    /// dst = src
    Copy {
        src: PServerVector,
        dst: PServerVector,
    },
    /// dst = src; src = 0. Canonicalizes the aggregated gradient as the
    /// variance-reduction anchor.
    CopyZero {
        src: PServerVector,
        dst: PServerVector,
    },
    /// v *= k
    Scale(PServerVector, f32),
    /// dst = k * src
    ScaleInto {
        dst: PServerVector,
        src: PServerVector,
        k: f32,
    },
    /// dst += k * src
    AddMult {
        dst: PServerVector,
        src: PServerVector,
        k: f32,
    },
    /// dst = a + k * b
    AddMultInto {
        dst: PServerVector,
        a: PServerVector,
        b: PServerVector,
        k: f32,
    },
    /// scalar result: a . b
    DotProduct(PServerVector, PServerVector),
    /// scalar result: accumulated trainer cost + l1/l2 regularization of
    /// `x`; folds the l2 term into `grad`. Consumes the accumulated cost.
    Cost {
        x: PServerVector,
        grad: PServerVector,
        l1: f32,
        l2: f32,
    },
    /// dir = negated pseudo-gradient of the l1-regularized objective.
    MakeSteepestDescDir {
        dir: PServerVector,
        grad: PServerVector,
        x: PServerVector,
        l1: f32,
    },
    /// Zero components of dir disagreeing with the steepest direction.
    FixDirSigns {
        dir: PServerVector,
        steepest: PServerVector,
    },
    /// Zero components of newx that left the orthant of x.
    FixOmegaSigns {
        newx: PServerVector,
        x: PServerVector,
    },
    /// scalar result: directional derivative along dir.
    DirDeriv {
        dir: PServerVector,
        grad: PServerVector,
        x: PServerVector,
        l1: f32,
    },
    /// value -= lr * (gradient + gradient_sum) on the built-in vectors.
    /// Skipped when the gradient round carried no contributions.
    Sgd,
    /// Opens a pass: releases data clients blocked in wait_pass_start.
    StartPass,
    /// Closes a pass: releases data clients blocked in wait_pass_finish.
    FinishPass,
}

/// An ordered batch of operations applied atomically server-side.
#[derive(Clone, Debug, Default)]
pub struct PreparedOperations {
    ops: Vec<Op>,
}

impl PreparedOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn ops(&self) -> &[Op] {
        &self.ops
    }
}

/// Scalar results of one op batch, in op submission order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OpResults {
    scalars: Vec<f32>,
}

impl OpResults {
    pub(crate) fn push(&mut self, value: f32) {
        self.scalars.push(value);
    }

    /// The i-th scalar-producing op's result.
    pub fn scalar(&self, i: usize) -> f32 {
        self.scalars[i]
    }

    pub fn len(&self) -> usize {
        self.scalars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty()
    }
}
