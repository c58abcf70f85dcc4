//! Runtime invariants with contract-test support
//!
//! Pipeline code states its invariants with [`assert_invariant!`]. Each check
//! is recorded per thread, so a test can run a pipeline and then prove with
//! [`contract_test`] that the invariants it cares about were actually
//! exercised.
//!
//! ```rust,ignore
//! use camfusion::invariant_ppt::contract_test;
//!
//! let output = engine.process(frames, &metadata, &options)?;
//! contract_test("hdr output", &["Fused output keeps input dimensions"]);
//! ```

use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static CHECKED: RefCell<HashMap<String, u64>> = RefCell::new(HashMap::new());
}

/// Assert an invariant and record that it was checked.
///
/// # Panics
/// Panics if the condition is false.
#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $message:expr) => {
        $crate::invariant_ppt::__record_invariant($condition, $message, None)
    };
    ($condition:expr, $message:expr, $context:expr) => {
        $crate::invariant_ppt::__record_invariant($condition, $message, Some($context))
    };
}

#[doc(hidden)]
pub fn __record_invariant(condition: bool, message: &str, context: Option<&str>) {
    CHECKED.with(|checked| {
        *checked.borrow_mut().entry(message.to_string()).or_insert(0) += 1;
    });

    if !condition {
        log::error!("invariant violated [{}]: {}", context.unwrap_or("-"), message);
        panic!(
            "INVARIANT VIOLATION [{}]: {}",
            context.unwrap_or("unknown"),
            message
        );
    }
}

/// How many times an invariant was checked on this thread
pub fn invariant_hits(message: &str) -> u64 {
    CHECKED.with(|checked| checked.borrow().get(message).copied().unwrap_or(0))
}

/// Panic unless every listed invariant was checked at least once on this
/// thread.
pub fn contract_test(test_name: &str, required_invariants: &[&str]) {
    let missing: Vec<&str> = required_invariants
        .iter()
        .copied()
        .filter(|message| invariant_hits(message) == 0)
        .collect();

    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: invariants never checked:\n  - {}",
            test_name,
            missing.join("\n  - ")
        );
    }
}

pub fn clear_invariant_log() {
    CHECKED.with(|checked| checked.borrow_mut().clear());
}
