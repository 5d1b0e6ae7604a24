use crate::cache::GIB;

pub(super) fn default_read_timeout_secs() -> u64 {
    300
}

pub(super) fn default_max_size() -> u64 {
    50 * GIB
}

pub(super) fn default_min_free_space() -> u64 {
    2 * GIB
}

pub(super) fn default_max_items() -> usize {
    100_000
}

pub(super) fn default_max_age_secs() -> u64 {
    21 * 24 * 60 * 60 // 3 weeks
}

pub(super) fn default_net_threads() -> usize {
    16
}

pub(super) fn default_cpu_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(2, 16)
}

pub(super) fn default_deadlock_timeout_secs() -> u64 {
    300
}
