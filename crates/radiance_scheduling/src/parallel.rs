//! Parallel sorting algorithms built on the task graph.

use crate::builder::TaskBuilder;
use radiance_thread::{TaskContext, TaskPool, Waitable};
use std::{slice, sync::Arc};

/// Ranges shorter than this are sorted sequentially on the spot instead of
/// being subdivided further.
const SEQUENTIAL_SORT_THRESHOLD: usize = 2048;

/// Sorts the slice in parallel using a task-graph merge sort. Not guaranteed
/// to preserve the order of equal elements.
///
/// Blocks the calling thread until the slice is sorted, so it may not be
/// called from a worker thread of the pool.
pub fn parallel_sort<T>(pool: &TaskPool, data: &mut [T])
where
    T: Ord + Clone + Send + 'static,
{
    sort_blocking(pool, data, false);
}

/// Sorts the slice in parallel using a task-graph merge sort, preserving the
/// order of equal elements.
///
/// Blocks the calling thread until the slice is sorted, so it may not be
/// called from a worker thread of the pool.
pub fn parallel_stable_sort<T>(pool: &TaskPool, data: &mut [T])
where
    T: Ord + Clone + Send + 'static,
{
    sort_blocking(pool, data, true);
}

fn sort_blocking<T>(pool: &TaskPool, data: &mut [T], stable: bool)
where
    T: Ord + Clone + Send + 'static,
{
    let waitable = Arc::new(Waitable::new());

    {
        let mut builder = TaskBuilder::with_waitable(pool, Arc::clone(&waitable));
        sort_range(&mut builder, SortRange::new(data), stable);
    }

    // Waiting here before returning is what keeps the `SortRange` raw
    // pointers valid for as long as any sort task can run.
    waitable.wait();
}

/// Subdivides the range into a sorting task subtree: two tasks sorting the
/// halves (each recursing with its own nested builder), a fence, and a merge
/// task. Small ranges are sorted sequentially on the calling thread instead.
fn sort_range<T>(builder: &mut TaskBuilder<'_>, range: SortRange<T>, stable: bool)
where
    T: Ord + Clone + Send + 'static,
{
    if range.len() < SEQUENTIAL_SORT_THRESHOLD {
        // SAFETY: The blocking entry point keeps the underlying slice
        // borrowed until the whole sort graph has finalised, and the
        // recursive subdivision hands every task a disjoint subrange.
        let data = unsafe { range.as_mut_slice() };
        if stable {
            data.sort();
        } else {
            data.sort_unstable();
        }
        return;
    }

    let middle = range.len() / 2;
    let (left, right) = range.split_at(middle);

    builder.task("sort left half", move |context: &TaskContext<'_>| {
        let mut builder = TaskBuilder::from_context(context);
        sort_range(&mut builder, left, stable);
    });

    builder.task("sort right half", move |context: &TaskContext<'_>| {
        let mut builder = TaskBuilder::from_context(context);
        sort_range(&mut builder, right, stable);
    });

    // The merge may only start once both half-sorting subtrees have
    // finalised.
    builder.fence();

    builder.task("merge halves", move |_context| {
        // SAFETY: As above; additionally, the fence guarantees that the
        // half-sorting tasks are done, so this task accesses the range
        // exclusively.
        let data = unsafe { range.as_mut_slice() };
        merge_sorted_halves(data, middle);
    });
}

/// Merges the two individually sorted halves `[0, middle)` and
/// `[middle, len)` of the slice. Equal elements from the left half are placed
/// first, keeping the merge stable.
fn merge_sorted_halves<T: Ord + Clone>(data: &mut [T], middle: usize) {
    if data[middle - 1] <= data[middle] {
        // The halves are already in order.
        return;
    }

    let merged = {
        let (left, right) = data.split_at(middle);
        let mut merged = Vec::with_capacity(data.len());

        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            if left[i] <= right[j] {
                merged.push(left[i].clone());
                i += 1;
            } else {
                merged.push(right[j].clone());
                j += 1;
            }
        }
        merged.extend_from_slice(&left[i..]);
        merged.extend_from_slice(&right[j..]);

        merged
    };

    data.clone_from_slice(&merged);
}

/// A raw handle to a disjoint subrange of the slice being sorted, movable
/// into task routines.
///
/// The handles are only dereferenced inside the sort graph, and the blocking
/// entry point waits for the graph before returning, so the underlying
/// borrow outlives every dereference. `split_at` produces non-overlapping
/// subranges, and the fence in [`sort_range`] separates the only two phases
/// (sort halves, merge) that touch the same range.
struct SortRange<T> {
    ptr: *mut T,
    len: usize,
}

// SAFETY: A `SortRange` is just a pointer into a slice of `T`; sending it to
// another thread is as safe as sending `&mut [T]` there.
unsafe impl<T: Send> Send for SortRange<T> {}

// The handle is freely copyable regardless of `T`; the derives would demand
// `T: Copy`.
impl<T> Clone for SortRange<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SortRange<T> {}

impl<T> SortRange<T> {
    fn new(data: &mut [T]) -> Self {
        Self {
            ptr: data.as_mut_ptr(),
            len: data.len(),
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn split_at(self, mid: usize) -> (Self, Self) {
        assert!(mid <= self.len);
        let left = Self {
            ptr: self.ptr,
            len: mid,
        };
        let right = Self {
            // SAFETY: `mid` is within the range, so the offset pointer stays
            // inside the same allocation.
            ptr: unsafe { self.ptr.add(mid) },
            len: self.len - mid,
        };
        (left, right)
    }

    /// Reconstructs the subrange as a mutable slice.
    ///
    /// # Safety
    /// The underlying slice must still be alive, and no other live
    /// `SortRange` overlapping this one may be dereferenced concurrently.
    unsafe fn as_mut_slice<'a>(self) -> &'a mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radiance_thread::{ThreadPool, ThreadPoolConfig};
    use std::{cmp::Ordering, num::NonZeroUsize};

    fn create_pool() -> ThreadPool {
        ThreadPool::with_config(ThreadPoolConfig {
            n_workers: Some(NonZeroUsize::new(4).unwrap()),
            task_capacity: 1 << 12,
        })
        .unwrap()
    }

    fn xorshift(mut x: u32) -> u32 {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        x
    }

    fn pseudorandom_values(len: usize) -> Vec<u32> {
        let mut seed = 4321;
        (0..len)
            .map(|_| {
                seed = xorshift(seed);
                seed
            })
            .collect()
    }

    #[test]
    fn sorting_large_array_matches_sequential_sort() {
        let pool = create_pool();

        let mut data = pseudorandom_values(100_000);
        let mut reference = data.clone();
        reference.sort_unstable();

        parallel_sort(pool.task_pool(), &mut data);
        assert_eq!(data, reference);
    }

    #[test]
    fn sorting_array_below_threshold_works() {
        let pool = create_pool();

        let mut data = pseudorandom_values(100);
        let mut reference = data.clone();
        reference.sort_unstable();

        parallel_sort(pool.task_pool(), &mut data);
        assert_eq!(data, reference);
    }

    #[test]
    fn sorting_empty_and_single_element_arrays_works() {
        let pool = create_pool();

        let mut empty: Vec<u32> = Vec::new();
        parallel_sort(pool.task_pool(), &mut empty);
        assert!(empty.is_empty());

        let mut single = vec![7_u32];
        parallel_sort(pool.task_pool(), &mut single);
        assert_eq!(single, vec![7]);
    }

    #[test]
    fn sorting_already_sorted_array_preserves_it() {
        let pool = create_pool();

        let mut data: Vec<u32> = (0..50_000).collect();
        let reference = data.clone();

        parallel_sort(pool.task_pool(), &mut data);
        assert_eq!(data, reference);
    }

    #[test]
    fn sorting_reverse_sorted_array_works() {
        let pool = create_pool();

        let mut data: Vec<u32> = (0..50_000).rev().collect();

        parallel_sort(pool.task_pool(), &mut data);
        assert!(data.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[derive(Clone, Debug)]
    struct Record {
        key: u8,
        sequence: u32,
    }

    impl PartialEq for Record {
        fn eq(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }

    impl Eq for Record {}

    impl PartialOrd for Record {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Record {
        fn cmp(&self, other: &Self) -> Ordering {
            self.key.cmp(&other.key)
        }
    }

    #[test]
    fn stable_sort_preserves_order_of_equal_elements() {
        let pool = create_pool();

        let mut data: Vec<Record> = pseudorandom_values(20_000)
            .into_iter()
            .enumerate()
            .map(|(sequence, value)| Record {
                key: (value % 16) as u8,
                sequence: sequence as u32,
            })
            .collect();

        parallel_stable_sort(pool.task_pool(), &mut data);

        for pair in data.windows(2) {
            assert!(pair[0].key <= pair[1].key);
            if pair[0].key == pair[1].key {
                assert!(pair[0].sequence < pair[1].sequence);
            }
        }
    }
}
