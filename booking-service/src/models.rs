use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::*;
use shared::Table;
use uuid::Uuid;
use crate::store::StoreError;

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::users)]
pub struct DbUser {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub student_id: Option<String>,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::tables)]
pub struct DbTable {
    pub id: Uuid,
    pub table_number: i32,
    pub capacity: i32,
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub is_active: bool,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::tables)]
pub struct NewTable {
    pub id: Uuid,
    pub table_number: i32,
    pub capacity: i32,
    pub position_x: Option<f64>,
    pub position_y: Option<f64>,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::seats)]
pub struct DbSeat {
    pub id: Uuid,
    pub table_id: Uuid,
    pub seat_number: i32,
    pub status: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::seats)]
pub struct NewSeat {
    pub id: Uuid,
    pub table_id: Uuid,
    pub seat_number: i32,
    pub status: String,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::bookings)]
pub struct DbBooking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub seat_id: Uuid,
    pub payment_status: String,
    pub amount: BigDecimal,
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::bookings)]
pub struct NewBooking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub seat_id: Uuid,
    pub payment_status: String,
    pub amount: BigDecimal,
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl NewBooking {
    /// A booking awaiting payment, as written by a seat claim.
    pub fn pending(user_id: Uuid, seat_id: Uuid, amount: BigDecimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            seat_id,
            payment_status: PaymentStatus::Pending.as_str().to_string(),
            amount,
            transaction_id: None,
            created_at: Utc::now(),
            paid_at: None,
        }
    }

    /// A booking an administrator hands out directly; it counts as paid.
    pub fn assigned(user_id: Uuid, seat_id: Uuid, amount: BigDecimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            seat_id,
            payment_status: PaymentStatus::Completed.as_str().to_string(),
            amount,
            transaction_id: None,
            created_at: now,
            paid_at: Some(now),
        }
    }
}

impl NewSeat {
    /// Seats `1..=capacity` of a freshly created table, all available.
    pub fn for_table(table_id: Uuid, capacity: i32) -> Vec<Self> {
        (1..=capacity)
            .map(|seat_number| Self {
                id: Uuid::new_v4(),
                table_id,
                seat_number,
                status: SeatStatus::Available.as_str().to_string(),
            })
            .collect()
    }
}

impl From<NewBooking> for DbBooking {
    fn from(new: NewBooking) -> Self {
        Self {
            id: new.id,
            user_id: new.user_id,
            seat_id: new.seat_id,
            payment_status: new.payment_status,
            amount: new.amount,
            transaction_id: new.transaction_id,
            created_at: new.created_at,
            paid_at: new.paid_at,
        }
    }
}

impl From<NewTable> for DbTable {
    fn from(new: NewTable) -> Self {
        Self {
            id: new.id,
            table_number: new.table_number,
            capacity: new.capacity,
            position_x: new.position_x,
            position_y: new.position_y,
            is_active: true,
            section: new.section,
        }
    }
}

impl From<NewSeat> for DbSeat {
    fn from(new: NewSeat) -> Self {
        Self {
            id: new.id,
            table_id: new.table_id,
            seat_number: new.seat_number,
            status: new.status,
        }
    }
}

impl TryFrom<DbUser> for User {
    type Error = StoreError;

    fn try_from(row: DbUser) -> Result<Self, Self::Error> {
        Ok(Self {
            role: row.role.parse().map_err(|e: BookingError| StoreError::Decode(e.to_string()))?,
            id: row.id,
            email: row.email,
            full_name: row.full_name,
            student_id: row.student_id,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

impl From<DbTable> for Table {
    fn from(row: DbTable) -> Self {
        Self {
            id: row.id,
            table_number: row.table_number,
            capacity: row.capacity,
            position_x: row.position_x,
            position_y: row.position_y,
            is_active: row.is_active,
            section: row.section,
        }
    }
}

impl TryFrom<DbSeat> for Seat {
    type Error = StoreError;

    fn try_from(row: DbSeat) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse().map_err(|e: BookingError| StoreError::Decode(e.to_string()))?,
            id: row.id,
            table_id: row.table_id,
            seat_number: row.seat_number,
        })
    }
}

impl TryFrom<DbBooking> for Booking {
    type Error = StoreError;

    fn try_from(row: DbBooking) -> Result<Self, Self::Error> {
        Ok(Self {
            payment_status: row
                .payment_status
                .parse()
                .map_err(|e: BookingError| StoreError::Decode(e.to_string()))?,
            id: row.id,
            user_id: row.user_id,
            seat_id: row.seat_id,
            amount: row.amount,
            transaction_id: row.transaction_id,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}
