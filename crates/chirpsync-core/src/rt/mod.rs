//! # Real-Time Threads
//!
//! The sensing and attacking loops each run on a dedicated OS thread. On
//! Linux those threads can be given SCHED_FIFO priorities, pinned to CPUs
//! and run with all memory locked, so that receive and transmit deadlines
//! are not missed to page faults or preemption.
//!
//! Every setting is best effort: without CAP_SYS_NICE the thread still runs,
//! and a warning is logged.

mod thread;

pub use thread::{spawn_rt_thread, RtConfig, RtError, RtPriority};
