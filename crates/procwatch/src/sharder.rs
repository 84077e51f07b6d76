//! Work sharding: how many workers to fork for a batch of files.

pub const DEFAULT_MAX_FILES_PER_FORK: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkPlan {
    pub num_forks: usize,
    pub files_per_fork: usize,
}

/// Bound the batch size by `max_per_fork`, then spread the files as evenly as
/// possible over the resulting number of forks.
///
/// `num_forks * files_per_fork >= num_files` always holds; the last fork may
/// get fewer files. A `max_per_fork` of zero is treated as one.
pub fn divide_files_per_fork(num_files: usize, max_per_fork: usize) -> ForkPlan {
    if num_files == 0 {
        return ForkPlan {
            num_forks: 0,
            files_per_fork: 0,
        };
    }
    let max_per_fork = max_per_fork.max(1);
    let num_forks = num_files.div_ceil(max_per_fork);
    let files_per_fork = num_files.div_ceil(num_forks);
    ForkPlan {
        num_forks,
        files_per_fork,
    }
}

/// Split `files` into per-fork batches following [`divide_files_per_fork`].
pub fn shard<T>(files: &[T], max_per_fork: usize) -> Vec<&[T]> {
    let plan = divide_files_per_fork(files.len(), max_per_fork);
    if plan.num_forks == 0 {
        return Vec::new();
    }
    files.chunks(plan.files_per_fork).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(num_forks: usize, files_per_fork: usize) -> ForkPlan {
        ForkPlan {
            num_forks,
            files_per_fork,
        }
    }

    #[test]
    fn exact_split() {
        assert_eq!(divide_files_per_fork(12, 5), plan(3, 4));
    }

    #[test]
    fn uneven_split_rebalances() {
        assert_eq!(divide_files_per_fork(11, 5), plan(3, 4));
        assert_eq!(divide_files_per_fork(6, 5), plan(2, 3));
    }

    #[test]
    fn single_file() {
        assert_eq!(divide_files_per_fork(1, DEFAULT_MAX_FILES_PER_FORK), plan(1, 1));
    }

    #[test]
    fn no_files() {
        assert_eq!(divide_files_per_fork(0, 5), plan(0, 0));
        assert!(shard::<u8>(&[], 5).is_empty());
    }

    #[test]
    fn zero_max_is_one_per_fork() {
        assert_eq!(divide_files_per_fork(3, 0), plan(3, 1));
    }

    #[test]
    fn plan_always_covers_all_files() {
        for max in 1..=8 {
            for n in 1..=100 {
                let p = divide_files_per_fork(n, max);
                assert!(p.num_forks * p.files_per_fork >= n, "n={n} max={max}");
                assert!(p.files_per_fork <= max, "n={n} max={max}");

                let files = vec![0u8; n];
                let shards = shard(&files, max);
                assert!(shards.len() <= p.num_forks, "n={n} max={max}");
                assert_eq!(shards.iter().map(|s| s.len()).sum::<usize>(), n);
                assert!(shards.iter().all(|s| !s.is_empty() && s.len() <= p.files_per_fork));
            }
        }
    }

    #[test]
    fn shard_last_batch_is_smaller() {
        let files: Vec<u32> = (0..11).collect();
        let shards = shard(&files, 5);
        let sizes: Vec<usize> = shards.iter().map(|s| s.len()).collect();
        assert_eq!(sizes, vec![4, 4, 3]);
    }
}
