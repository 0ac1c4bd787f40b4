//! definition of the general ethercat error type

use core::fmt;
use crate::data::PackingError;

/**
    general object reporting an unexpected result regarding mailbox communication

    Its variant are meant to help finding the cause responsible for the problem and how to deal with it. None of them is fatal to the mailbox service: every error is eventually reported to the master (with an error frame or a protocol specific error code) and the service keeps running.

    [Self::Service] variant should not be used without an appropriate type for `T`, `T` depend on the operation reporting, and is usually an error code, or an enum.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EthercatError<T=()> {
    /// error specific to the service that processed the request (dictionary, file system, ethernet parameters ...)
    ///
    /// these errors are answered to the master with the service's own error codes
    Service(T),

    /// the master sent content this slave cannot understand
    ///
    /// these errors are answered to the master with a mailbox error frame
    Protocol(&'static str),

    /// a message arrived out of the expected sequence (fragment, packet or counter number)
    ///
    /// the transfer in progress is abandonned and has to be restarted by the master
    Sequence(&'static str),

    /// the data does not fit the buffers of this slave
    ///
    /// nothing has been applied
    Capacity(&'static str),

    /// error is due to too much time elapsed, but does not compromise the communication
    ///
    /// these errors are generally contextual and the operation can be retried.
    Timeout(&'static str),
}

/// convenient alias to simplify return annotations
pub type EthercatResult<T=(), E=()> = core::result::Result<T, EthercatError<E>>;

impl<T: fmt::Debug> fmt::Display for EthercatError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(value) => write!(f, "service error: {:?}", value),
            Self::Protocol(message) => write!(f, "protocol error: {}", message),
            Self::Sequence(message) => write!(f, "sequence error: {}", message),
            Self::Capacity(message) => write!(f, "capacity error: {}", message),
            Self::Timeout(message) => write!(f, "timeout: {}", message),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EthercatError<T> {}

impl<T> From<PackingError> for EthercatError<T> {
    fn from(src: PackingError) -> Self {
        EthercatError::Protocol(match src {
            PackingError::BadSize(_, text) => text,
            PackingError::InvalidValue(text) => text,
        })
    }
}

// because rust doesn't allow specialization and already implements `From<T> for T`, we cannot write smart conversions for generic EthercatError<T>, so these are manual conversion methods
impl<E> EthercatError<E> {
    /// convert the error if the service specific error type allows it
    pub fn into<F>(self) -> EthercatError<F>
    where F: From<E> {
        self.map(|e| F::from(e))
    }
    /// convert the error with a callback handling the case of service-specific error
    pub fn map<F,T>(self, callback: F) -> EthercatError<T>
    where F: Fn(E) -> T
    {
        match self {
            EthercatError::Service(value) => EthercatError::Service(callback(value)),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Sequence(message) => EthercatError::Sequence(message),
            EthercatError::Capacity(message) => EthercatError::Capacity(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
        }
    }
}
impl EthercatError<()> {
    /// convert an error with no service-specific type into an error with any service type
    pub fn upgrade<F>(self) -> EthercatError<F> {
        match self {
            EthercatError::Service(()) => EthercatError::Protocol("unspecified service error"),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Sequence(message) => EthercatError::Sequence(message),
            EthercatError::Capacity(message) => EthercatError::Capacity(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
        }
    }
}
