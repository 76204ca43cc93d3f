/// Compile-time-checked file path macros, handy for hardware-gated tests
/// that need a fixture on disk before the test body runs.
pub mod macros;
