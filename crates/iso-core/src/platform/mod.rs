pub mod fs;

/// One line per thread of this process: id, name, state and the kernel
/// function it is blocked in.
///
/// Rust cannot walk the stacks of other threads, so this is what the
/// deadlock detector logs instead of call stacks.
pub fn thread_report() -> String {
    #[cfg(target_os = "linux")]
    {
        let mut lines = Vec::new();
        let Ok(entries) = std::fs::read_dir("/proc/self/task") else {
            return "thread list unavailable".into();
        };
        let mut tids: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        tids.sort_by_key(|t| t.parse::<u64>().unwrap_or(u64::MAX));
        for tid in tids {
            let base = std::path::Path::new("/proc/self/task").join(&tid);
            let read = |name: &str| {
                std::fs::read_to_string(base.join(name))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default()
            };
            let comm = read("comm");
            let wchan = read("wchan");
            // Field 3 of stat is the state letter; comm (field 2) may contain spaces.
            let stat = read("stat");
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .unwrap_or("?")
                .to_string();
            lines.push(format!("tid {tid} [{comm}] state={state} wchan={wchan}"));
        }
        lines.join("\n")
    }

    #[cfg(not(target_os = "linux"))]
    {
        let current = std::thread::current();
        format!(
            "thread list unavailable on this platform; reporter is {:?} ({})",
            current.id(),
            current.name().unwrap_or("unnamed")
        )
    }
}
