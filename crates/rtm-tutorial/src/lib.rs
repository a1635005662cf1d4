//! rtm-tutorial library entry point.
//!
//! Re-exports the modules so that integration tests in `tests/` and the
//! binary entry point in `main.rs` share the same module tree.
//!
//! # What does the tutorial do? (for beginners)
//!
//! It is the smallest complete program built on `rtm-core`:
//!
//! 1. Connects to the service with an application key.
//! 2. Authenticates with a role and secret, if the config has an `[auth]`
//!    table.
//! 3. Subscribes to a channel (`animals` by default).
//! 4. Publishes a JSON message to that channel, waits for the publish to be
//!    acknowledged and for the message to arrive back on the subscription,
//!    pauses, and repeats.

/// Configuration file loading.
pub mod config;

/// The handler and the publish/echo loop.
pub mod app;
