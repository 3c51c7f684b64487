use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

mod error;

pub use error::BookingError;

/// Lifecycle of a single seat. `Selected` and `Reserved` seats are always
/// referenced by exactly one booking; `Available` and `Blocked` seats never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeatStatus {
    Available,
    Selected,
    Reserved,
    Blocked,
}

impl SeatStatus {
    pub const ALL: [SeatStatus; 4] = [
        SeatStatus::Available,
        SeatStatus::Selected,
        SeatStatus::Reserved,
        SeatStatus::Blocked,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Available => "available",
            SeatStatus::Selected => "selected",
            SeatStatus::Reserved => "reserved",
            SeatStatus::Blocked => "blocked",
        }
    }

    /// Whether a seat in this state must be backed by a booking row.
    pub fn is_held(&self) -> bool {
        matches!(self, SeatStatus::Selected | SeatStatus::Reserved)
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeatStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(SeatStatus::Available),
            "selected" => Ok(SeatStatus::Selected),
            "reserved" => Ok(SeatStatus::Reserved),
            "blocked" => Ok(SeatStatus::Blocked),
            other => Err(BookingError::Validation(format!("unknown seat status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Student,
    Admin,
}

impl UserRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            UserRole::Student => "student",
            UserRole::Admin => "admin",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(UserRole::Student),
            "admin" => Ok(UserRole::Admin),
            other => Err(BookingError::Validation(format!("unknown user role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = BookingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(BookingError::Validation(format!("unknown payment status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub student_id: Option<String>,
    pub role: UserRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub full_name: String,
    pub student_id: Option<String>,
    pub role: UserRole,
}

/// Public sign-up. Always produces a student account.
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub student_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub id: Uuid,
    pub table_number: i32,
    pub capacity: i32,
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub is_active: bool,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSpec {
    pub table_number: i32,
    pub capacity: i32,
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub section: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seat {
    pub id: Uuid,
    pub table_id: Uuid,
    pub seat_number: i32,
    pub status: SeatStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableWithSeats {
    #[serde(flatten)]
    pub table: Table,
    pub seats: Vec<Seat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub seat_id: Uuid,
    pub payment_status: PaymentStatus,
    pub amount: BigDecimal,
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Completed
    }
}

/// A seat together with the number of the table it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatView {
    #[serde(flatten)]
    pub seat: Seat,
    pub table_number: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingDetails {
    #[serde(flatten)]
    pub booking: Booking,
    pub seat: SeatView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_seats: i64,
    pub available_seats: i64,
    pub reserved_seats: i64,
    pub pending_payments: i64,
    pub total_revenue: BigDecimal,
}

/// Verified identity of whoever is calling into the booking core.
/// A seat after an administrator status change, with the booking the change
/// removed from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatOverride {
    pub seat: Seat,
    pub evicted: Option<Booking>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}
