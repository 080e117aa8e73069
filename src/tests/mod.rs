//! Cross-component integration tests.
//!
//! Unit tests live next to the code they cover; these exercise the wired-up
//! control plane: metrics cache → auto-scaler → orchestrator, and health
//! check → recovery → checkpoint restore under the shared circuit registry.

mod integration_tests;
