// Open File Liveness Check
//
// Scans `/proc` for processes using anything under a partition directory:
// open descriptors, working directory and memory-mapped files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

use super::{Liveness, LivenessCheck};

/// Reports a partition busy while any process holds a file under it open,
/// maps one into memory, or runs with its working directory inside it.
///
/// Reads `/proc/<pid>/{fd,cwd,maps}`, so it only works on Linux. An
/// unreadable proc root is an error, never an idle result.
#[derive(Debug, Clone)]
pub struct OpenFileCheck {
    proc_root: PathBuf,
    process_prefix: Option<String>,
}

impl OpenFileCheck {
    pub fn new(process_prefix: Option<String>) -> Self {
        Self::with_proc_root("/proc", process_prefix)
    }

    pub fn with_proc_root(proc_root: impl Into<PathBuf>, process_prefix: Option<String>) -> Self {
        Self {
            proc_root: proc_root.into(),
            process_prefix,
        }
    }

    fn is_candidate(&self, process_dir: &Path) -> bool {
        let Some(prefix) = &self.process_prefix else {
            return true;
        };
        match fs::read_to_string(process_dir.join("comm")) {
            Ok(comm) => comm.trim_end().starts_with(prefix.as_str()),
            Err(_) => false,
        }
    }

    /// `None` when the process exited or cannot be inspected and is not a
    /// storage process.
    fn inspect<T>(&self, pid: &str, result: io::Result<T>) -> io::Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            // A storage process we are not allowed to inspect could be a holder.
            Err(err) if self.process_prefix.is_some() => Err(err),
            Err(err) => {
                trace!(pid, error = %err, "skipping uninspectable process");
                Ok(None)
            }
        }
    }

    fn holder(&self, pid: &str, process_dir: &Path, target: &Path) -> io::Result<Option<String>> {
        if let Some(fds) = self.inspect(pid, fs::read_dir(process_dir.join("fd")))? {
            for fd in fds.flatten() {
                let Ok(link) = fs::read_link(fd.path()) else {
                    continue;
                };
                if link.starts_with(target) {
                    return Ok(Some(format!("pid {pid} holds {}", link.display())));
                }
            }
        }

        if let Some(cwd) = self.inspect(pid, fs::read_link(process_dir.join("cwd")))? {
            if cwd.starts_with(target) {
                return Ok(Some(format!("pid {pid} runs in {}", cwd.display())));
            }
        }

        if let Some(maps) = self.inspect(pid, fs::read_to_string(process_dir.join("maps")))? {
            if let Some(mapped) = maps.lines().filter_map(mapped_path).find(|p| p.starts_with(target)) {
                return Ok(Some(format!("pid {pid} maps {}", mapped.display())));
            }
        }

        Ok(None)
    }
}

/// Path column of a `/proc/<pid>/maps` line, if the mapping is file backed.
fn mapped_path(line: &str) -> Option<&Path> {
    let mut rest = line;
    // address perms offset dev inode
    for _ in 0..5 {
        rest = rest.trim_start();
        rest = &rest[rest.find(char::is_whitespace)?..];
    }
    let path = rest.trim_start();
    path.starts_with('/').then(|| Path::new(path))
}

impl LivenessCheck for OpenFileCheck {
    fn name(&self) -> &'static str {
        "open-files"
    }

    fn check(&self, partition_dir: &Path) -> io::Result<Liveness> {
        let target = partition_dir
            .canonicalize()
            .unwrap_or_else(|_| partition_dir.to_path_buf());

        for entry in fs::read_dir(&self.proc_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
                continue;
            };

            let process_dir = entry.path();
            if !self.is_candidate(&process_dir) {
                continue;
            }

            if let Some(reason) = self.holder(pid, &process_dir, &target)? {
                return Ok(Liveness::Busy(reason));
            }
        }
        Ok(Liveness::Idle)
    }
}
