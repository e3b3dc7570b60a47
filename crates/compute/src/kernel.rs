use std::fmt;

use crate::Device;

/// A compiled compute pipeline bound to one entry point.
///
/// Owned by the caller; dropping it releases the pipeline.
pub struct Kernel<D: Device> {
    pub(crate) pipeline: D::Pipeline,
    entry_point: String,
    pub(crate) workgroup_size: Option<[u32; 3]>,
    pub(crate) bindings: Vec<u32>,
}

impl<D: Device> Kernel<D> {
    pub(crate) fn new(
        pipeline: D::Pipeline,
        entry_point: String,
        workgroup_size: Option<[u32; 3]>,
        bindings: Vec<u32>,
    ) -> Self {
        Self {
            pipeline,
            entry_point,
            workgroup_size,
            bindings,
        }
    }

    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Group size declared by the kernel source, if the backend fixes one.
    #[must_use]
    pub fn workgroup_size(&self) -> Option<[u32; 3]> {
        self.workgroup_size
    }

    /// Binding slots the entry point uses.
    #[must_use]
    pub fn bindings(&self) -> &[u32] {
        &self.bindings
    }
}

impl<D: Device> fmt::Debug for Kernel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("entry_point", &self.entry_point)
            .field("workgroup_size", &self.workgroup_size)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

/// Number of groups of `group_size` needed to cover `threads`.
///
/// # Panics
///
/// Panics if `group_size` is zero.
#[must_use]
pub const fn group_count(threads: u32, group_size: u32) -> u32 {
    assert!(group_size >= 1, "group size must be at least 1");
    threads.div_ceil(group_size)
}

/// Per-axis [`group_count`].
///
/// # Panics
///
/// Panics if any axis of `group_size` is zero.
#[must_use]
pub const fn group_counts(threads: [u32; 3], group_size: [u32; 3]) -> [u32; 3] {
    [
        group_count(threads[0], group_size[0]),
        group_count(threads[1], group_size[1]),
        group_count(threads[2], group_size[2]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_threads_in_groups_of_four_need_three_groups() {
        assert_eq!(group_count(10, 4), 3);
    }

    #[test]
    fn exact_multiple_needs_no_extra_group() {
        assert_eq!(group_count(256, 64), 4);
        assert_eq!(group_count(1, 1), 1);
    }

    #[test]
    fn zero_threads_need_zero_groups() {
        assert_eq!(group_count(0, 8), 0);
    }

    #[test]
    fn covers_without_a_spare_group() {
        for threads in 0..300u32 {
            for group_size in 1..70u32 {
                let groups = group_count(threads, group_size);
                assert!(groups * group_size >= threads);
                if threads > 0 {
                    assert!((groups - 1) * group_size < threads);
                }
            }
        }
    }

    #[test]
    fn does_not_overflow_near_the_top_of_the_range() {
        assert_eq!(group_count(u32::MAX, 2), u32::MAX / 2 + 1);
        assert_eq!(group_count(u32::MAX, u32::MAX), 1);
    }

    #[test]
    fn per_axis_counts() {
        assert_eq!(group_counts([256, 10, 1], [64, 4, 1]), [4, 3, 1]);
    }

    #[test]
    #[should_panic(expected = "group size must be at least 1")]
    fn zero_group_size_is_rejected() {
        let _ = group_count(16, 0);
    }
}
