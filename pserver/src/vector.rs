/// Opaque handle to a vector stored on the parameter server.
///
/// The remote storage lives from `create_vector` until the explicit
/// `release_vector`; there is no implicit collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PServerVector(pub(crate) u32);

impl PServerVector {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}
