//! End-to-end tests for the greytrap-rs daemon live under `tests/`.
