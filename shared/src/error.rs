use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BookingError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("seat was just taken by another request, pick a different seat")]
    Conflict,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("you already have a booking, cancel it first to book another seat")]
    AlreadyBooked,

    #[error("payment already completed")]
    AlreadyPaid,

    #[error("payment was declined")]
    PaymentDeclined,

    #[error("{0} already registered")]
    AlreadyRegistered(&'static str),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not authenticated")]
    Unauthorized,

    #[error("not permitted")]
    Forbidden,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
