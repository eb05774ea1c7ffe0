//! # Real-Time Thread Spawning
//!
//! Spawns the subsystem threads with the priority, CPU affinity and memory
//! locking taken from the `realtime` section of the experiment config.
//!
//! ## Platform Support
//!
//! - **Linux**: SCHED_FIFO, CPU affinity, mlockall
//! - **Other**: settings are ignored with a debug message
//!
//! ## Example
//!
//! ```rust,no_run
//! use chirpsync_core::config::RealtimeConfig;
//! use chirpsync_core::rt::{spawn_rt_thread, RtConfig};
//!
//! let realtime = RealtimeConfig::default();
//! let handle = spawn_rt_thread(RtConfig::sensing(&realtime), || 42).unwrap();
//! assert_eq!(handle.join().unwrap(), 42);
//! ```

use std::thread::{self, JoinHandle};

use crate::config::RealtimeConfig;

/// Error type for real-time thread operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RtError {
    #[error("failed to spawn thread: {0}")]
    SpawnFailed(String),

    #[error("failed to set priority: {0}")]
    PriorityFailed(String),

    #[error("failed to set CPU affinity: {0}")]
    AffinityFailed(String),

    #[error("failed to lock memory: {0}")]
    MlockFailed(String),
}

/// Scheduling class of a spawned thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RtPriority {
    /// Default time-sharing scheduler
    #[default]
    Normal,
    /// SCHED_FIFO with the given priority (clamped to 1-99)
    Fifo(i32),
}

impl RtPriority {
    /// Convert to Linux SCHED_FIFO priority (0 for `Normal`).
    pub fn to_linux_priority(self) -> i32 {
        match self {
            RtPriority::Normal => 0,
            RtPriority::Fifo(p) => p.clamp(1, 99),
        }
    }

    pub fn is_realtime(&self) -> bool {
        !matches!(self, RtPriority::Normal)
    }
}

/// Configuration for spawning a subsystem thread.
#[derive(Debug, Clone, PartialEq)]
pub struct RtConfig {
    /// Thread name (shows up in `top -H` and panics)
    pub name: String,
    pub priority: RtPriority,
    /// CPU cores to pin the thread to (empty = no affinity)
    pub cpu_affinity: Vec<usize>,
    /// Stack size in bytes (0 = default)
    pub stack_size: usize,
    /// Whether to lock memory (mlockall)
    pub lock_memory: bool,
}

impl RtConfig {
    /// Plain thread with default scheduling.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            priority: RtPriority::Normal,
            cpu_affinity: Vec::new(),
            stack_size: 0,
            lock_memory: false,
        }
    }

    fn from_realtime(name: &str, realtime: &RealtimeConfig, priority: i32, cpus: &[usize]) -> Self {
        if !realtime.enable {
            return Self::new(name);
        }
        Self {
            name: name.to_string(),
            priority: RtPriority::Fifo(priority),
            cpu_affinity: cpus.to_vec(),
            stack_size: 0,
            lock_memory: realtime.lock_memory,
        }
    }

    /// Settings for the sensing thread.
    pub fn sensing(realtime: &RealtimeConfig) -> Self {
        Self::from_realtime(
            "sensing",
            realtime,
            realtime.sensing_priority,
            &realtime.sensing_cpus,
        )
    }

    /// Settings for the attacking thread.
    pub fn attacking(realtime: &RealtimeConfig) -> Self {
        Self::from_realtime(
            "attacking",
            realtime,
            realtime.attacking_priority,
            &realtime.attacking_cpus,
        )
    }
}

impl Default for RtConfig {
    fn default() -> Self {
        Self::new("rt_thread")
    }
}

/// Spawn a thread and apply `config` from inside it before running `f`.
///
/// Only the spawn itself can fail. Priority, affinity and memory locking
/// need elevated privileges on Linux (CAP_SYS_NICE / CAP_IPC_LOCK); when
/// they are refused the thread runs anyway and a warning is logged.
pub fn spawn_rt_thread<F, T>(config: RtConfig, f: F) -> Result<JoinHandle<T>, RtError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let mut builder = thread::Builder::new().name(config.name.clone());

    if config.stack_size > 0 {
        builder = builder.stack_size(config.stack_size);
    }

    builder
        .spawn(move || {
            apply_rt_settings(&config);
            f()
        })
        .map_err(|e| RtError::SpawnFailed(e.to_string()))
}

fn apply_rt_settings(config: &RtConfig) {
    if config.priority.is_realtime() {
        if let Err(e) = set_thread_priority(config.priority) {
            tracing::warn!(thread = %config.name, "{}", e);
        }
    }

    if !config.cpu_affinity.is_empty() {
        if let Err(e) = set_cpu_affinity(&config.cpu_affinity) {
            tracing::warn!(thread = %config.name, "{}", e);
        }
    }

    if config.lock_memory {
        if let Err(e) = lock_all_memory() {
            tracing::warn!(thread = %config.name, "{}", e);
        }
    }

    tracing::debug!(
        thread = %config.name,
        priority = config.priority.to_linux_priority(),
        cpus = ?config.cpu_affinity,
        "thread started"
    );
}

#[cfg(target_os = "linux")]
fn set_thread_priority(priority: RtPriority) -> Result<(), RtError> {
    // SAFETY: sched_param is plain data; pid 0 targets the calling thread.
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority.to_linux_priority();

        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(RtError::PriorityFailed(format!(
                "sched_setscheduler failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_thread_priority(_priority: RtPriority) -> Result<(), RtError> {
    tracing::debug!("real-time priority not supported on this platform");
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpus: &[usize]) -> Result<(), RtError> {
    // SAFETY: cpu_set_t is plain data manipulated only through the libc macros.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);

        for &cpu in cpus {
            if cpu < libc::CPU_SETSIZE as usize {
                libc::CPU_SET(cpu, &mut set);
            }
        }

        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(RtError::AffinityFailed(format!(
                "sched_setaffinity failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_cpus: &[usize]) -> Result<(), RtError> {
    tracing::debug!("CPU affinity not supported on this platform");
    Ok(())
}

#[cfg(target_os = "linux")]
fn lock_all_memory() -> Result<(), RtError> {
    // SAFETY: mlockall takes only flags.
    unsafe {
        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) != 0 {
            return Err(RtError::MlockFailed(format!(
                "mlockall failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn lock_all_memory() -> Result<(), RtError> {
    tracing::debug!("memory locking not supported on this platform");
    Ok(())
}
