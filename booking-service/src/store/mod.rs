//! Persistence for users, tables, seats and bookings.
//!
//! Every `commit_*` method, `repair_seat`, `create_table` and `delete_table` is a
//! single all-or-nothing transaction. Uniqueness of the seat and user edges of a
//! booking is enforced by the store itself, so two racing writers can never both
//! succeed no matter what the caller checked beforehand.
//!
//! Writers that touch both a seat and its booking lock the seat row first.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::result::DatabaseErrorKind;
use shared::*;
use thiserror::Error;
use uuid::Uuid;
use crate::models::{NewBooking, NewSeat, NewTable};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("unique constraint {constraint} violated")]
    UniqueViolation { constraint: String },

    #[error("precondition failed: {0}")]
    Precondition(&'static str),

    #[error("could not decode row: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => StoreError::NotFound,
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::UniqueViolation {
                    constraint: info.constraint_name().unwrap_or("unknown").to_string(),
                }
            }
            other => StoreError::Database(other),
        }
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for StoreError {
    fn from(err: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        StoreError::Pool(err.to_string())
    }
}

pub const SEAT_BOOKING_KEY: &str = "bookings_seat_id_key";
pub const USER_BOOKING_KEY: &str = "bookings_user_id_key";
pub const TABLE_NUMBER_KEY: &str = "tables_table_number_key";
pub const USER_EMAIL_KEY: &str = "users_email_key";
pub const USER_STUDENT_ID_KEY: &str = "users_student_id_key";

/// Payment details stamped onto a booking when it is settled.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub transaction_id: String,
    pub paid_at: DateTime<Utc>,
}

/// Outcome of an administrator reassignment.
#[derive(Debug, Clone)]
pub struct Reassignment {
    pub booking: Booking,
    /// The other user's booking removed from the target seat, if any.
    pub evicted: Option<Booking>,
}

#[async_trait]
pub trait SeatStore: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError>;

    async fn find_seat(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError>;

    async fn find_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, StoreError>;

    async fn booking_for_user(&self, user_id: Uuid) -> Result<Option<Booking>, StoreError>;

    async fn booking_for_seat(&self, seat_id: Uuid) -> Result<Option<Booking>, StoreError>;

    async fn booking_details(&self, booking_id: Uuid) -> Result<Option<BookingDetails>, StoreError>;

    async fn list_tables(&self, active_only: bool) -> Result<Vec<TableWithSeats>, StoreError>;

    async fn list_bookings(&self) -> Result<Vec<Booking>, StoreError>;

    async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError>;

    /// Flips the seat `available -> selected` and inserts the pending booking.
    /// Fails with `Precondition` if the seat was not available at commit time and
    /// with `UniqueViolation` if the seat or the user already has a booking.
    async fn commit_claim(&self, booking: NewBooking) -> Result<Booking, StoreError>;

    /// Marks a not-yet-completed booking as paid and its seat as reserved.
    async fn commit_settlement(&self, booking_id: Uuid, receipt: Receipt) -> Result<(Booking, Seat), StoreError>;

    /// Deletes a not-yet-completed booking and frees its seat.
    async fn commit_release(&self, booking_id: Uuid) -> Result<(Booking, Seat), StoreError>;

    /// Gives `seat_id` to `user_id` as a completed booking, evicting whoever held
    /// the seat and freeing the user's previous seat.
    async fn commit_force_assign(&self, user_id: Uuid, seat_id: Uuid, amount: bigdecimal::BigDecimal) -> Result<Reassignment, StoreError>;

    /// Overrides a seat's status. Moving to `available` or `blocked` drops the
    /// booking on the seat and returns it; moving to `selected` or `reserved`
    /// requires one.
    async fn commit_seat_status(&self, seat_id: Uuid, status: SeatStatus) -> Result<(Seat, Option<Booking>), StoreError>;

    /// Returns a held seat to `available` if, and only if, no booking references it.
    async fn repair_seat(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError>;

    async fn create_table(&self, table: NewTable, seats: Vec<NewSeat>) -> Result<TableWithSeats, StoreError>;

    /// Removes a table and its seats unless one of them is reserved or booked.
    async fn delete_table(&self, table_id: Uuid) -> Result<(), StoreError>;
}

/// Attaches seats to their tables, preserving table order.
pub(crate) fn group_tables(tables: Vec<Table>, seats: Vec<Seat>) -> Vec<TableWithSeats> {
    let mut grouped: Vec<TableWithSeats> = tables
        .into_iter()
        .map(|table| TableWithSeats { table, seats: Vec::new() })
        .collect();

    for seat in seats {
        if let Some(entry) = grouped.iter_mut().find(|t| t.table.id == seat.table_id) {
            entry.seats.push(seat);
        }
    }
    for entry in &mut grouped {
        entry.seats.sort_by_key(|s| s.seat_number);
    }

    grouped
}
