//! Trace event emission.
//!
//! The allocator reports through the [`log`] facade under the `"mem"`
//! target; the firmware installs whatever logger its trace transport
//! provides. Events are informational heap status lines, errors are
//! caller mistakes and allocation failures.

macro_rules! trace_mem {
    ($($arg:tt)*) => {
        log::debug!(target: "mem", $($arg)*)
    };
}

macro_rules! trace_mem_error {
    ($($arg:tt)*) => {
        log::error!(target: "mem", $($arg)*)
    };
}

pub(crate) use trace_mem;
pub(crate) use trace_mem_error;
