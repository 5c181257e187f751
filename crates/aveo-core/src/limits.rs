//! Stack-size bounds shared by the facade and the runtime's context-open
//! path, so both sides clamp against the same floor/default.

/// Minimum stack size a context may be configured with.
pub const VEO_STACK_MIN: u64 = 4 * 1024 * 1024;
/// Stack size used when nothing overrides it.
pub const VEO_DEFAULT_STACKSIZE: u64 = 128 * 1024 * 1024;
