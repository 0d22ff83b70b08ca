//! Resource limits and confinement for interpreter processes
//!
//! Limits are applied with `setrlimit` in the forked child before the
//! interpreter is exec'd. When the kernel allows unprivileged user
//! namespaces, the child also gets private network and mount namespaces in
//! which the shared temp directories are replaced by the run's own scratch
//! directory.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;

/// Where a confined run sees its scratch directory
pub(crate) const CONFINED_SCRATCH: &str = "/tmp";

/// Directories shared between processes that a confined run gets privately
#[cfg(target_os = "linux")]
const SHARED_TEMP_DIRS: &[&str] = &["/var/tmp", "/dev/shm"];

pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_MAX_PROCESSES: u64 = 1024;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_CPU_SECONDS: u64 = 30;

/// Limits for every interpreter process a worker starts. Zero means
/// unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, clap::Args)]
#[serde(default)]
pub struct ResourceLimits {
    /// Address-space limit per process, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MEMORY_BYTES)]
    pub max_memory_bytes: u64,

    /// Processes the worker's user may own while code runs
    #[arg(long, default_value_t = DEFAULT_MAX_PROCESSES)]
    pub max_processes: u64,

    /// Largest file a run may write, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FILE_BYTES)]
    pub max_file_bytes: u64,

    /// CPU time per process, in seconds
    #[arg(long, default_value_t = DEFAULT_MAX_CPU_SECONDS)]
    pub max_cpu_seconds: u64,

    /// Run code in private user, network and mount namespaces when the
    /// kernel permits it
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub namespaces: bool,

    /// Refuse to load when namespaces are unavailable
    #[arg(long)]
    pub require_namespaces: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_processes: DEFAULT_MAX_PROCESSES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_cpu_seconds: DEFAULT_MAX_CPU_SECONDS,
            namespaces: true,
            require_namespaces: false,
        }
    }
}

impl ResourceLimits {
    /// No limits and no namespaces
    pub fn unlimited() -> Self {
        Self {
            max_memory_bytes: 0,
            max_processes: 0,
            max_file_bytes: 0,
            max_cpu_seconds: 0,
            namespaces: false,
            require_namespaces: false,
        }
    }

    /// Command-line form understood by the worker binary
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--max-memory-bytes={}", self.max_memory_bytes),
            format!("--max-processes={}", self.max_processes),
            format!("--max-file-bytes={}", self.max_file_bytes),
            format!("--max-cpu-seconds={}", self.max_cpu_seconds),
            format!("--namespaces={}", self.namespaces),
        ];
        if self.require_namespaces {
            args.push("--require-namespaces".to_string());
        }
        args
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.require_namespaces && !self.namespaces {
            return Err("require_namespaces needs namespaces enabled".into());
        }
        Ok(())
    }

    /// Whether this platform can confine runs in namespaces at all
    pub fn namespaces_supported() -> bool {
        cfg!(target_os = "linux")
    }
}

/// Install the limits, and the namespaces when `confined`, as a pre-exec
/// hook on `command`. A failure in the hook makes the spawn fail.
#[cfg(target_os = "linux")]
pub(crate) fn confine(
    command: &mut Command,
    limits: &ResourceLimits,
    scratch: &Path,
    confined: bool,
) {
    let limits = limits.clone();
    let scratch = scratch.to_path_buf();
    let id_maps = confined.then(IdMaps::current);
    // SAFETY: the hook only makes syscalls and writes short files through
    // stack-allocated paths; everything it needs was built before the fork.
    unsafe {
        command.pre_exec(move || {
            if let Some(maps) = &id_maps {
                enter_namespaces(maps, &scratch)?;
            }
            apply_rlimits(&limits)
        });
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn confine(
    _command: &mut Command,
    _limits: &ResourceLimits,
    _scratch: &Path,
    _confined: bool,
) {
}

/// Identity mappings for the new user namespace, formatted before the fork
#[cfg(target_os = "linux")]
struct IdMaps {
    uid_map: String,
    gid_map: String,
}

#[cfg(target_os = "linux")]
impl IdMaps {
    fn current() -> Self {
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        Self {
            uid_map: format!("{0} {0} 1", uid),
            gid_map: format!("{0} {0} 1", gid),
        }
    }
}

#[cfg(target_os = "linux")]
fn enter_namespaces(maps: &IdMaps, scratch: &Path) -> std::io::Result<()> {
    use nix::mount::{mount, MsFlags};
    use nix::sched::{unshare, CloneFlags};

    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWNET)?;
    std::fs::write("/proc/self/setgroups", b"deny")?;
    std::fs::write("/proc/self/uid_map", maps.uid_map.as_bytes())?;
    std::fs::write("/proc/self/gid_map", maps.gid_map.as_bytes())?;

    // Keep our mounts out of the host's namespace
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    mount(
        Some(scratch),
        CONFINED_SCRATCH,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;
    for dir in SHARED_TEMP_DIRS {
        if Path::new(dir).is_dir() {
            // Best effort; /tmp is the one interpreters actually use
            let _ = mount(
                Some(CONFINED_SCRATCH),
                *dir,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            );
        }
    }
    std::env::set_current_dir(CONFINED_SCRATCH)
}

#[cfg(target_os = "linux")]
fn apply_rlimits(limits: &ResourceLimits) -> std::io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    let wanted = [
        (Resource::RLIMIT_AS, limits.max_memory_bytes),
        (Resource::RLIMIT_NPROC, limits.max_processes),
        (Resource::RLIMIT_FSIZE, limits.max_file_bytes),
        (Resource::RLIMIT_CPU, limits.max_cpu_seconds),
    ];
    for (resource, value) in wanted {
        if value == 0 {
            continue;
        }
        // Never ask for more than the hard limit we inherited
        let (_, hard) = getrlimit(resource)?;
        let value = value.min(hard);
        setrlimit(resource, value, value)?;
    }
    Ok(())
}
