//! Propagation failure type shared by the header and payload codecs.

use thiserror::Error;

/// Non-fatal failure while reading or writing trace context.
///
/// An extract failure means the transaction starts a fresh trace; an inject
/// failure leaves the carrier unwritten. Neither aborts the transaction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Inbound context could not be read from the carrier.
    #[error("{propagator} could not extract: {detail}")]
    Extract {
        detail: &'static str,
        propagator: &'static str,
    },
    /// Outbound context could not be written to the carrier.
    #[error("{propagator} could not inject: {detail}")]
    Inject {
        detail: &'static str,
        propagator: &'static str,
    },
}

impl Error {
    pub(crate) fn extract(detail: &'static str, propagator: &'static str) -> Self {
        Error::Extract { detail, propagator }
    }

    pub(crate) fn inject(detail: &'static str, propagator: &'static str) -> Self {
        Error::Inject { detail, propagator }
    }
}
