//! Lifecycle logging on stderr.
//!
//! Loading, demotion and unloading are reported through `verbose!()` once
//! `set_verbose(true)` has been called (the CLI wires this to `--verbose`).
//! Conditions that must always be visible go through `warning!()`. Both
//! macros expand to a `()` expression, so they can stand as a match arm.

use std::sync::atomic::{AtomicBool, Ordering};

static LIFECYCLE_LOG: AtomicBool = AtomicBool::new(false);

/// Turn lifecycle logging on or off for the whole process
pub fn set_verbose(enabled: bool) {
    LIFECYCLE_LOG.store(enabled, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    LIFECYCLE_LOG.load(Ordering::Relaxed)
}

/// `[verbose]`-prefixed line, printed only when lifecycle logging is on
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)*) => {
        if $crate::verbose::is_verbose() {
            eprintln!("[verbose] {}", format_args!($($arg)*))
        }
    };
}

/// `Warning:`-prefixed line, always printed
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => {
        eprintln!("Warning: {}", format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_macros_in_expression_position() {
        let parsed: Result<u32, String> = Err("bad".to_string());
        let value = match parsed {
            Ok(v) => v,
            Err(e) => {
                let () = match e.len() {
                    0 => crate::verbose!("empty error"),
                    _ => crate::warning!("ignoring value: {}", e),
                };
                0
            }
        };
        assert_eq!(value, 0);

        let outcome: Result<(), String> = Err("x".to_string());
        match outcome {
            Ok(()) => crate::verbose!("fine"),
            Err(e) => crate::warning!("failed: {}", e),
        }
    }
}
