//! Process self-metrics for `status` responses.

/// Resident set size of this process in bytes. `None` when procfs is
/// unavailable (non-Linux hosts).
pub fn resident_memory_bytes() -> Option<u64> {
    let process = procfs::process::Process::myself().ok()?;
    let stat = process.stat().ok()?;
    Some(stat.rss * procfs::page_size())
}
