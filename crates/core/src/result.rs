//! Operation status codes.

/// Outcome of a hooking operation.
///
/// The two success-like codes come first and are contiguous, so
/// [`HookStatus::is_success`] is a single comparison. The numeric values
/// are part of the C ABI and must not be reordered.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookStatus {
    /// Operation completed.
    Success = 0,
    /// Operation was valid but left the state unchanged.
    NoEffect = 1,
    /// No trampoline slot could be allocated within reach of the target.
    AllocFail = 2,
    /// The prologue could not be transplanted or the redirect could not be
    /// written.
    CannotSet = 3,
    /// The target or replacement already participates in a hook.
    Duplicate = 4,
    /// Null, overlapping, or otherwise unusable addresses.
    BadArg = 5,
    /// Internal bookkeeping is inconsistent; treat as a bug.
    Internal = 6,
    /// No hook is registered for the given address.
    NotFound = 7,
}

impl HookStatus {
    /// Whether the code represents a successful operation.
    pub const fn is_success(self) -> bool {
        (self as i32) <= (HookStatus::NoEffect as i32)
    }

    pub const fn describe(self) -> &'static str {
        match self {
            HookStatus::Success => "success",
            HookStatus::NoEffect => "no effect",
            HookStatus::AllocFail => "failed to allocate a reachable trampoline",
            HookStatus::CannotSet => "failed to set the hook",
            HookStatus::Duplicate => "address already participates in a hook",
            HookStatus::BadArg => "invalid argument",
            HookStatus::Internal => "internal error",
            HookStatus::NotFound => "no hook found for address",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_predicate() {
        assert!(HookStatus::Success.is_success());
        assert!(HookStatus::NoEffect.is_success());
        assert!(!HookStatus::AllocFail.is_success());
        assert!(!HookStatus::CannotSet.is_success());
        assert!(!HookStatus::Duplicate.is_success());
        assert!(!HookStatus::BadArg.is_success());
        assert!(!HookStatus::Internal.is_success());
        assert!(!HookStatus::NotFound.is_success());
    }

    #[test]
    fn test_abi_values_are_stable() {
        assert_eq!(HookStatus::Success as i32, 0);
        assert_eq!(HookStatus::NoEffect as i32, 1);
        assert_eq!(HookStatus::NotFound as i32, 7);
    }
}
