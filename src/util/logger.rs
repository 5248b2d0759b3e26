//! This module provides a built-in logger implementation.
//!
//! The built-in logger implementation uses the `env_logger` crate. It is
//! enabled by the Cargo feature "builtin_env_logger" which is enabled by
//! default. When enabled, it is initialized in [`crate::VmArena::new`] and
//! shows logs of levels WARN or lower (the lower, the more important).
//!
//! This provides a convenient out-of-the-box experience so that warnings
//! (invalid frees, double frees, failed OS calls) are visible without
//! configuration. Embedders that already have a `log` implementation can
//! disable the feature and register their own.

/// Attempt to init an env_logger.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show warnings and errors.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"),
            );

            match result {
                Ok(()) => {
                    debug!("vmarena initialized the logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` is only raised when a logger has
                    // already been initialized, which is fine.
                    debug!("vmarena did not initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("vmarena didn't initialize the built-in env_logger. The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
