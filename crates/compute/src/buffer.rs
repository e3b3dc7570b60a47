use std::fmt;

use crate::Device;

/// How a buffer is declared to the backend. Affects binding rules only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Constant,
    Structured { element_stride: usize },
}

/// Role a buffer plays in the next dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferBinding {
    Constant,
    Input,
    Output,
}

/// Whether the GPU may hold bytes the staging copy has not seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Residency {
    #[default]
    Clean,
    PendingGpuWrite,
}

impl Residency {
    /// Binding as output assumes the dispatch writes; other roles leave the
    /// flag as it was.
    #[must_use]
    pub const fn bind(self, binding: BufferBinding) -> Self {
        match binding {
            BufferBinding::Output => Residency::PendingGpuWrite,
            BufferBinding::Constant | BufferBinding::Input => self,
        }
    }

    #[must_use]
    pub const fn needs_sync(self) -> bool {
        matches!(self, Residency::PendingGpuWrite)
    }
}

/// GPU storage of fixed length with a CPU-visible staging copy.
///
/// Owned by the caller. Dropping it releases the native allocation; it must
/// not be dropped while work that references it is still unwaited.
pub struct Buffer<D: Device> {
    pub(crate) raw: D::Buffer,
    len: usize,
    kind: BufferKind,
    pub(crate) residency: Residency,
}

impl<D: Device> Buffer<D> {
    pub(crate) fn new(raw: D::Buffer, len: usize, kind: BufferKind) -> Self {
        Self {
            raw,
            len,
            kind,
            residency: Residency::Clean,
        }
    }

    /// Size in bytes, fixed at creation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    #[must_use]
    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub(crate) fn check_range(&self, offset: usize, size: usize) {
        let end = offset.checked_add(size);
        assert!(
            end.is_some_and(|end| end <= self.len),
            "buffer access out of range: offset {offset} + size {size} exceeds buffer length {}",
            self.len
        );
    }
}

impl<D: Device> fmt::Debug for Buffer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("kind", &self.kind)
            .field("residency", &self.residency)
            .finish_non_exhaustive()
    }
}
