//! Cross-component lifecycle tests driving the real executor and runner
//! against a stubbed agent binary.

#[cfg(unix)]
mod lifecycle_tests;
