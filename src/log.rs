//! Logging facade, selects between `log` and `defmt` backends

#[cfg(not(feature = "defmt"))]
pub use ::log::{trace, debug, info, warn, error};

#[cfg(feature = "defmt")]
pub use defmt::{trace, debug, info, warn, error};

/// Bound for errors that may be emitted via the active logging backend
#[cfg(not(feature = "defmt"))]
pub trait FmtError: core::fmt::Debug {}

#[cfg(not(feature = "defmt"))]
impl <T: core::fmt::Debug> FmtError for T {}

/// Bound for errors that may be emitted via the active logging backend
#[cfg(feature = "defmt")]
pub trait FmtError: core::fmt::Debug + defmt::Format {}

#[cfg(feature = "defmt")]
impl <T: core::fmt::Debug + defmt::Format> FmtError for T {}
