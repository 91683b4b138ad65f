//! Thread-local runtime error state.
//!
//! Generated native code cannot propagate a `Result` through its own
//! frames, so dispatch shims called from it report faults here; the host
//! checks after the call returns.

use std::cell::RefCell;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub fn set_runtime_error(msg: impl Into<String>) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg.into()));
}

/// Take (and clear) the last runtime error message.
pub fn take_runtime_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

pub fn has_runtime_error() -> bool {
    LAST_ERROR.with(|e| e.borrow().is_some())
}

pub fn clear_runtime_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_take_clear() {
        clear_runtime_error();
        assert!(!has_runtime_error());
        set_runtime_error("boom");
        assert!(has_runtime_error());
        assert_eq!(take_runtime_error().as_deref(), Some("boom"));
        assert!(!has_runtime_error());
    }
}
