//! Process-wide logging setup.
//!
//! Grounded in the teacher's `main.rs`: `env_logger` configured from
//! `RUST_LOG` with an `info` default, timestamps to the second. The
//! teacher pipes to a log file to keep its TUI's alternate screen clean;
//! this crate has no TUI, so it logs straight to stderr, which is the
//! teacher's own fallback shape for non-interactive paths.
//!
//! Call sites throughout the crate use `[Component]`-bracketed tags
//! (`[broker]`, `[forwarding stripe N]`, `[bridge]`) matching the teacher's
//! own `[Socket]`/`[HttpProxy]` bracket convention.

/// Initializes the global logger exactly once. Safe to call from multiple
/// binaries in the same process (tests); `env_logger::Builder::init`
/// itself is idempotent-safe to call once per process, so callers should
/// only invoke this from a binary's `main`.
pub fn init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init()
        .ok();
}
