use std::{
    collections::BTreeMap,
    mem,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{ParamError, Result};

/// Shared dense f32 storage.
///
/// Clones alias the same underlying vector, which is how slave replicas
/// obtain a shared view of the main replica's VALUE buffer.
#[derive(Clone, Debug)]
pub struct DenseBuf(Arc<RwLock<Vec<f32>>>);

impl DenseBuf {
    pub fn zeros(len: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![0.0; len])))
    }

    pub fn from_vec(values: Vec<f32>) -> Self {
        Self(Arc::new(RwLock::new(values)))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `self` and `other` alias the same storage.
    pub fn ptr_eq(&self, other: &DenseBuf) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.0.write()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.0.read().clone()
    }

    pub fn zero(&self) {
        self.0.write().fill(0.0);
    }

    pub fn fill(&self, value: f32) {
        self.0.write().fill(value);
    }

    /// Copies `src` into this buffer.
    ///
    /// # Panics
    /// If the lengths differ (an init-time shape invariant, not a
    /// recoverable condition).
    pub fn copy_from_slice(&self, src: &[f32]) {
        let mut data = self.0.write();
        assert_eq!(data.len(), src.len(), "buffer length mismatch");
        data.copy_from_slice(src);
    }

    pub fn copy_from(&self, other: &DenseBuf) {
        if self.ptr_eq(other) {
            return;
        }
        let src = other.0.read();
        self.copy_from_slice(&src);
    }

    /// Copies this buffer into `out`.
    pub fn copy_to(&self, out: &mut [f32]) -> Result<()> {
        let data = self.0.read();
        if data.len() != out.len() {
            return Err(ParamError::SizeMismatch {
                what: "buffer",
                got: out.len(),
                expected: data.len(),
            });
        }
        out.copy_from_slice(&data);
        Ok(())
    }

    /// self += other
    pub fn add(&self, other: &DenseBuf) {
        let src = other.0.read();
        self.add_slice(&src);
    }

    /// self += src
    pub fn add_slice(&self, src: &[f32]) {
        let mut data = self.0.write();
        assert_eq!(data.len(), src.len(), "buffer length mismatch");
        data.iter_mut().zip(src).for_each(|(d, s)| *d += s);
    }

    /// self = -self
    pub fn neg(&self) {
        self.0.write().iter_mut().for_each(|d| *d = -*d);
    }

    /// self *= k
    pub fn scale(&self, k: f32) {
        self.0.write().iter_mut().for_each(|d| *d *= k);
    }

    /// self += a * x
    pub fn axpy(&self, a: f32, x: &DenseBuf) {
        let src = x.0.read();
        let mut data = self.0.write();
        assert_eq!(data.len(), src.len(), "buffer length mismatch");
        data.iter_mut().zip(src.iter()).for_each(|(d, s)| *d += a * s);
    }

    pub fn dot(&self, other: &DenseBuf) -> f64 {
        if self.ptr_eq(other) {
            let data = self.0.read();
            return data.iter().map(|a| (*a as f64) * (*a as f64)).sum();
        }
        let a = self.0.read();
        let b = other.0.read();
        assert_eq!(a.len(), b.len(), "buffer length mismatch");
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (*x as f64) * (*y as f64))
            .sum()
    }

    pub fn abs_sum(&self) -> f64 {
        self.0.read().iter().map(|a| a.abs() as f64).sum()
    }

    pub fn abs_max(&self) -> f32 {
        self.0.read().iter().fold(0.0f32, |m, a| m.max(a.abs()))
    }

    /// Deep content swap, used by the VALUE / SNAPSHOT_VALUE protocol.
    ///
    /// Locks are taken in address order so two threads swapping the same
    /// pair cannot deadlock.
    pub fn swap(&self, other: &DenseBuf) {
        if self.ptr_eq(other) {
            return;
        }
        let (first, second) = if Arc::as_ptr(&self.0) < Arc::as_ptr(&other.0) {
            (self, other)
        } else {
            (other, self)
        };
        let mut a = first.0.write();
        let mut b = second.0.write();
        mem::swap(&mut *a, &mut *b);
    }
}

/// Lock-free shared f32 storage, used by the async-SGD path.
///
/// Values are f32 bit patterns in `AtomicU32` cells with relaxed
/// ordering. `add` is a load/store pair, not a compare-and-swap:
/// concurrent read-modify-writes of the same cell can lose updates.
/// That race is the documented cost of async SGD, kept as in the
/// original design rather than hidden behind a lock.
#[derive(Clone, Debug)]
pub struct AtomicBuf {
    data: Arc<[AtomicU32]>,
}

impl AtomicBuf {
    pub fn zeros(len: usize) -> Self {
        Self {
            data: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn from_vec(values: Vec<f32>) -> Self {
        Self {
            data: values.into_iter().map(|v| AtomicU32::new(v.to_bits())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ptr_eq(&self, other: &AtomicBuf) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn get(&self, i: usize) -> f32 {
        f32::from_bits(self.data[i].load(Ordering::Relaxed))
    }

    pub fn set(&self, i: usize, value: f32) {
        self.data[i].store(value.to_bits(), Ordering::Relaxed);
    }

    /// Non-atomic read-modify-write; lost updates are possible.
    pub fn add(&self, i: usize, delta: f32) {
        self.set(i, self.get(i) + delta);
    }

    pub fn zero(&self) {
        for cell in self.data.iter() {
            cell.store(0, Ordering::Relaxed);
        }
    }

    pub fn copy_from_slice(&self, src: &[f32]) {
        assert_eq!(self.data.len(), src.len(), "buffer length mismatch");
        for (cell, v) in self.data.iter().zip(src) {
            cell.store(v.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data
            .iter()
            .map(|cell| f32::from_bits(cell.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Row-indexed sparse gradient storage.
///
/// Each worker accumulates the rows its own mini-batch touched; the row
/// map is cleared at the start of every batch.
#[derive(Clone, Debug)]
pub struct SparseRowBuf {
    inner: Arc<RwLock<BTreeMap<usize, Vec<f32>>>>,
    width: usize,
}

impl SparseRowBuf {
    pub fn new(width: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BTreeMap::new())),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// row += values
    pub fn add_row(&self, row: usize, values: &[f32]) {
        assert_eq!(values.len(), self.width, "sparse row width mismatch");
        let mut rows = self.inner.write();
        let entry = rows.entry(row).or_insert_with(|| vec![0.0; self.width]);
        entry.iter_mut().zip(values).for_each(|(e, v)| *e += v);
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn num_rows(&self) -> usize {
        self.inner.read().len()
    }

    /// Visits every touched row in index order.
    pub fn for_each_row<F: FnMut(usize, &[f32])>(&self, mut f: F) {
        let rows = self.inner.read();
        for (row, values) in rows.iter() {
            f(*row, values);
        }
    }
}

/// Per-row update timestamps (u32 batch counters) for the staleness-aware
/// sparse ASGD rule.
#[derive(Clone, Debug)]
pub struct IntBuf(Arc<RwLock<Vec<u32>>>);

impl IntBuf {
    pub fn zeros(len: usize) -> Self {
        Self(Arc::new(RwLock::new(vec![0; len])))
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn get(&self, i: usize) -> u32 {
        self.0.read()[i]
    }

    pub fn set(&self, i: usize, value: u32) {
        self.0.write()[i] = value;
    }

    pub fn zero(&self) {
        self.0.write().fill(0);
    }
}

/// A purpose-tagged parameter buffer.
///
/// The variant is decided once when the owning parameter enables the
/// buffer type and never changes afterwards, so call sites dispatch on
/// an enum instead of downcasting per call.
#[derive(Clone, Debug)]
pub enum Buffer {
    Dense(DenseBuf),
    Atomic(AtomicBuf),
    SparseRow(SparseRowBuf),
}

impl Buffer {
    pub fn len(&self) -> usize {
        match self {
            Buffer::Dense(b) => b.len(),
            Buffer::Atomic(b) => b.len(),
            Buffer::SparseRow(b) => b.num_rows() * b.width(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_dense(&self) -> Option<&DenseBuf> {
        match self {
            Buffer::Dense(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_atomic(&self) -> Option<&AtomicBuf> {
        match self {
            Buffer::Atomic(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_sparse_row(&self) -> Option<&SparseRowBuf> {
        match self {
            Buffer::SparseRow(b) => Some(b),
            _ => None,
        }
    }

    /// Clears the buffer contents (gradient reset between batches).
    pub fn zero(&self) {
        match self {
            Buffer::Dense(b) => b.zero(),
            Buffer::Atomic(b) => b.zero(),
            Buffer::SparseRow(b) => b.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_ops() {
        let a = DenseBuf::from_vec(vec![1.0, 2.0, 3.0]);
        let b = DenseBuf::from_vec(vec![4.0, 5.0, 6.0]);

        a.add(&b);
        assert_eq!(a.to_vec(), [5.0, 7.0, 9.0]);

        a.axpy(-1.0, &b);
        assert_eq!(a.to_vec(), [1.0, 2.0, 3.0]);

        assert_eq!(a.dot(&b), 32.0);
        assert_eq!(a.abs_sum(), 6.0);

        a.neg();
        assert_eq!(a.abs_max(), 3.0);
        assert_eq!(a.to_vec(), [-1.0, -2.0, -3.0]);
    }

    #[test]
    fn dense_swap_is_deep() {
        let a = DenseBuf::from_vec(vec![1.0]);
        let b = DenseBuf::from_vec(vec![2.0]);
        let a_alias = a.clone();

        a.swap(&b);

        assert_eq!(a.to_vec(), [2.0]);
        assert_eq!(b.to_vec(), [1.0]);
        // aliases observe the swap: contents moved, not handles
        assert_eq!(a_alias.to_vec(), [2.0]);
    }

    #[test]
    fn dense_copy_to_size_mismatch() {
        let a = DenseBuf::zeros(3);
        let mut out = [0.0; 2];
        assert_eq!(
            a.copy_to(&mut out),
            Err(ParamError::SizeMismatch {
                what: "buffer",
                got: 2,
                expected: 3
            })
        );
    }

    #[test]
    fn atomic_roundtrip() {
        let buf = AtomicBuf::from_vec(vec![1.5, -2.5]);
        buf.add(0, 0.5);
        assert_eq!(buf.get(0), 2.0);
        assert_eq!(buf.to_vec(), [2.0, -2.5]);
    }

    #[test]
    fn sparse_rows_accumulate() {
        let buf = SparseRowBuf::new(2);
        buf.add_row(3, &[1.0, 1.0]);
        buf.add_row(3, &[0.5, 0.0]);
        buf.add_row(1, &[2.0, 2.0]);

        let mut seen = Vec::new();
        buf.for_each_row(|row, vals| seen.push((row, vals.to_vec())));
        assert_eq!(
            seen,
            vec![(1, vec![2.0, 2.0]), (3, vec![1.5, 1.0])]
        );

        buf.clear();
        assert_eq!(buf.num_rows(), 0);
    }
}
