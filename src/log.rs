//! Logging macros that optionally forward to the `log` crate.
//!
//! Without the `logging` feature the arguments are still evaluated by
//! reference so call sites do not trigger unused-variable warnings.

macro_rules! ldebug {
    ($fmt:literal $(, $($arg:expr),* $(,)?)?) => {
        #[cfg(feature = "logging")]
        ::log::debug!($fmt $(, $($arg),*)?);
        #[cfg(not(feature = "logging"))]
        { $($(let _ = &$arg;)*)? }
    };
}

macro_rules! ltrace {
    ($fmt:literal $(, $($arg:expr),* $(,)?)?) => {
        #[cfg(feature = "logging")]
        ::log::trace!($fmt $(, $($arg),*)?);
        #[cfg(not(feature = "logging"))]
        { $($(let _ = &$arg;)*)? }
    };
}

macro_rules! lwarn {
    ($fmt:literal $(, $($arg:expr),* $(,)?)?) => {
        #[cfg(feature = "logging")]
        ::log::warn!($fmt $(, $($arg),*)?);
        #[cfg(not(feature = "logging"))]
        { $($(let _ = &$arg;)*)? }
    };
}
