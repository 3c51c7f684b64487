use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use num_traits::Zero;
use shared::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;
use crate::models::*;
use super::{
    group_tables, Reassignment, Receipt, SeatStore, StoreError, SEAT_BOOKING_KEY, TABLE_NUMBER_KEY,
    USER_BOOKING_KEY, USER_EMAIL_KEY, USER_STUDENT_ID_KEY,
};

/// Process-local store with the same unique keys and conditional writes as the
/// Postgres schema. Each operation runs under one lock acquisition and validates
/// everything before it writes, so a failed operation leaves no trace.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    tables: HashMap<Uuid, Table>,
    seats: HashMap<Uuid, Seat>,
    bookings: HashMap<Uuid, Booking>,
    // unique indexes
    user_emails: HashMap<String, Uuid>,
    user_student_ids: HashMap<String, Uuid>,
    table_numbers: HashMap<i32, Uuid>,
    booking_by_seat: HashMap<Uuid, Uuid>,
    booking_by_user: HashMap<Uuid, Uuid>,
    transaction_ids: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Pool("memory store lock poisoned".to_string()))
    }

    /// Writes a seat status without touching bookings. Lets tests recreate the
    /// half-applied states a crashed writer could leave behind.
    #[cfg(test)]
    pub(crate) fn overwrite_seat_status(&self, seat_id: Uuid, status: SeatStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.seats.get_mut(&seat_id).unwrap().status = status;
    }
}

impl Inner {
    fn booking_on_seat(&self, seat_id: Uuid) -> Option<&Booking> {
        self.booking_by_seat
            .get(&seat_id)
            .and_then(|id| self.bookings.get(id))
    }

    fn booking_of_user(&self, user_id: Uuid) -> Option<&Booking> {
        self.booking_by_user
            .get(&user_id)
            .and_then(|id| self.bookings.get(id))
    }

    fn check_booking_keys(&self, booking: &Booking) -> Result<(), StoreError> {
        let taken = |index: &HashMap<Uuid, Uuid>, key: &Uuid| {
            index.get(key).map_or(false, |owner| *owner != booking.id)
        };

        if taken(&self.booking_by_seat, &booking.seat_id) {
            return Err(unique(SEAT_BOOKING_KEY));
        }
        if taken(&self.booking_by_user, &booking.user_id) {
            return Err(unique(USER_BOOKING_KEY));
        }
        if let Some(txn) = &booking.transaction_id {
            let current = self
                .bookings
                .get(&booking.id)
                .and_then(|b| b.transaction_id.as_ref());
            if current != Some(txn) && self.transaction_ids.contains(txn) {
                return Err(unique("bookings_transaction_id_key"));
            }
        }
        Ok(())
    }

    fn put_booking(&mut self, booking: Booking) -> Booking {
        if let Some(previous) = self.bookings.remove(&booking.id) {
            self.unindex(&previous);
        }
        self.booking_by_seat.insert(booking.seat_id, booking.id);
        self.booking_by_user.insert(booking.user_id, booking.id);
        if let Some(txn) = &booking.transaction_id {
            self.transaction_ids.insert(txn.clone());
        }
        self.bookings.insert(booking.id, booking.clone());
        booking
    }

    fn remove_booking(&mut self, booking_id: Uuid) -> Option<Booking> {
        let booking = self.bookings.remove(&booking_id)?;
        self.unindex(&booking);
        Some(booking)
    }

    fn unindex(&mut self, booking: &Booking) {
        self.booking_by_seat.remove(&booking.seat_id);
        self.booking_by_user.remove(&booking.user_id);
        if let Some(txn) = &booking.transaction_id {
            self.transaction_ids.remove(txn);
        }
    }

    fn set_seat(&mut self, seat_id: Uuid, status: SeatStatus) -> Result<Seat, StoreError> {
        let seat = self.seats.get_mut(&seat_id).ok_or(StoreError::NotFound)?;
        seat.status = status;
        Ok(seat.clone())
    }
}

fn unique(constraint: &str) -> StoreError {
    StoreError::UniqueViolation {
        constraint: constraint.to_string(),
    }
}

#[async_trait]
impl SeatStore for MemoryStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .user_emails
            .get(email)
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut inner = self.lock()?;

        if inner.user_emails.contains_key(&user.email) {
            return Err(unique(USER_EMAIL_KEY));
        }
        if let Some(student_id) = &user.student_id {
            if inner.user_student_ids.contains_key(student_id) {
                return Err(unique(USER_STUDENT_ID_KEY));
            }
        }

        let user = User {
            id: Uuid::new_v4(),
            email: user.email,
            full_name: user.full_name,
            student_id: user.student_id,
            role: user.role,
            is_active: true,
            created_at: Utc::now(),
        };
        inner.user_emails.insert(user.email.clone(), user.id);
        if let Some(student_id) = &user.student_id {
            inner.user_student_ids.insert(student_id.clone(), user.id);
        }
        inner.users.insert(user.id, user.clone());

        Ok(user)
    }

    async fn find_seat(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError> {
        Ok(self.lock()?.seats.get(&seat_id).cloned())
    }

    async fn find_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, StoreError> {
        Ok(self.lock()?.bookings.get(&booking_id).cloned())
    }

    async fn booking_for_user(&self, user_id: Uuid) -> Result<Option<Booking>, StoreError> {
        Ok(self.lock()?.booking_of_user(user_id).cloned())
    }

    async fn booking_for_seat(&self, seat_id: Uuid) -> Result<Option<Booking>, StoreError> {
        Ok(self.lock()?.booking_on_seat(seat_id).cloned())
    }

    async fn booking_details(&self, booking_id: Uuid) -> Result<Option<BookingDetails>, StoreError> {
        let inner = self.lock()?;

        let Some(booking) = inner.bookings.get(&booking_id) else {
            return Ok(None);
        };
        let seat = inner.seats.get(&booking.seat_id).ok_or(StoreError::NotFound)?;
        let table = inner.tables.get(&seat.table_id).ok_or(StoreError::NotFound)?;

        Ok(Some(BookingDetails {
            booking: booking.clone(),
            seat: SeatView {
                seat: seat.clone(),
                table_number: table.table_number,
            },
        }))
    }

    async fn list_tables(&self, active_only: bool) -> Result<Vec<TableWithSeats>, StoreError> {
        let inner = self.lock()?;

        let mut tables: Vec<Table> = inner
            .tables
            .values()
            .filter(|t| !active_only || t.is_active)
            .cloned()
            .collect();
        tables.sort_by_key(|t| t.table_number);

        Ok(group_tables(tables, inner.seats.values().cloned().collect()))
    }

    async fn list_bookings(&self) -> Result<Vec<Booking>, StoreError> {
        let mut bookings: Vec<Booking> = self.lock()?.bookings.values().cloned().collect();
        bookings.sort_by_key(|b| b.created_at);
        Ok(bookings)
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError> {
        let inner = self.lock()?;

        let count_seats = |status: SeatStatus| {
            inner.seats.values().filter(|s| s.status == status).count() as i64
        };

        Ok(DashboardStats {
            total_seats: inner.seats.len() as i64,
            available_seats: count_seats(SeatStatus::Available),
            reserved_seats: count_seats(SeatStatus::Reserved),
            pending_payments: inner
                .bookings
                .values()
                .filter(|b| b.payment_status == PaymentStatus::Pending)
                .count() as i64,
            total_revenue: inner
                .bookings
                .values()
                .filter(|b| b.is_paid())
                .fold(BigDecimal::zero(), |sum, b| sum + &b.amount),
        })
    }

    async fn commit_claim(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let mut inner = self.lock()?;
        let booking = Booking::try_from(DbBooking::from(booking))?;

        match inner.seats.get(&booking.seat_id) {
            Some(seat) if seat.status == SeatStatus::Available => {}
            _ => return Err(StoreError::Precondition("seat is not available")),
        }
        inner.check_booking_keys(&booking)?;

        inner.set_seat(booking.seat_id, SeatStatus::Selected)?;
        Ok(inner.put_booking(booking))
    }

    async fn commit_settlement(&self, booking_id: Uuid, receipt: Receipt) -> Result<(Booking, Seat), StoreError> {
        let mut inner = self.lock()?;

        let mut booking = inner.bookings.get(&booking_id).cloned().ok_or(StoreError::NotFound)?;
        if booking.is_paid() {
            return Err(StoreError::Precondition("booking already completed"));
        }
        booking.payment_status = PaymentStatus::Completed;
        booking.transaction_id = Some(receipt.transaction_id);
        booking.paid_at = Some(receipt.paid_at);
        inner.check_booking_keys(&booking)?;

        let seat = inner.set_seat(booking.seat_id, SeatStatus::Reserved)?;
        Ok((inner.put_booking(booking), seat))
    }

    async fn commit_release(&self, booking_id: Uuid) -> Result<(Booking, Seat), StoreError> {
        let mut inner = self.lock()?;

        let booking = inner.bookings.get(&booking_id).ok_or(StoreError::NotFound)?;
        if booking.is_paid() {
            return Err(StoreError::Precondition("booking already completed"));
        }
        if !inner.seats.contains_key(&booking.seat_id) {
            return Err(StoreError::NotFound);
        }

        let booking = inner.remove_booking(booking_id).ok_or(StoreError::NotFound)?;
        let seat = inner.set_seat(booking.seat_id, SeatStatus::Available)?;
        Ok((booking, seat))
    }

    async fn commit_force_assign(&self, user_id: Uuid, seat_id: Uuid, amount: BigDecimal) -> Result<Reassignment, StoreError> {
        let mut inner = self.lock()?;

        if !inner.seats.contains_key(&seat_id) || !inner.users.contains_key(&user_id) {
            return Err(StoreError::NotFound);
        }

        let occupant = inner
            .booking_on_seat(seat_id)
            .filter(|b| b.user_id != user_id)
            .map(|b| b.id);
        let own = inner.booking_of_user(user_id).cloned();

        let evicted = occupant.and_then(|id| inner.remove_booking(id));

        let booking = match own {
            Some(mut own) => {
                if own.seat_id != seat_id {
                    inner.set_seat(own.seat_id, SeatStatus::Available)?;
                }
                own.seat_id = seat_id;
                own.payment_status = PaymentStatus::Completed;
                own.paid_at = own.paid_at.or(Some(Utc::now()));
                own
            }
            None => Booking::try_from(DbBooking::from(NewBooking::assigned(user_id, seat_id, amount)))?,
        };

        inner.set_seat(seat_id, SeatStatus::Reserved)?;
        Ok(Reassignment {
            booking: inner.put_booking(booking),
            evicted,
        })
    }

    async fn commit_seat_status(&self, seat_id: Uuid, status: SeatStatus) -> Result<(Seat, Option<Booking>), StoreError> {
        let mut inner = self.lock()?;

        if !inner.seats.contains_key(&seat_id) {
            return Err(StoreError::NotFound);
        }

        let booking = inner.booking_on_seat(seat_id).map(|b| b.id);
        let evicted = match (status.is_held(), booking) {
            (false, Some(booking_id)) => inner.remove_booking(booking_id),
            (true, None) => return Err(StoreError::Precondition("seat has no booking to hold it")),
            _ => None,
        };

        let seat = inner.set_seat(seat_id, status)?;
        Ok((seat, evicted))
    }

    async fn repair_seat(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError> {
        let mut inner = self.lock()?;

        let orphaned = match inner.seats.get(&seat_id) {
            Some(seat) => seat.status.is_held() && inner.booking_on_seat(seat_id).is_none(),
            None => false,
        };
        if !orphaned {
            return Ok(None);
        }

        inner.set_seat(seat_id, SeatStatus::Available).map(Some)
    }

    async fn create_table(&self, table: NewTable, seats: Vec<NewSeat>) -> Result<TableWithSeats, StoreError> {
        let mut inner = self.lock()?;

        if inner.table_numbers.contains_key(&table.table_number) {
            return Err(unique(TABLE_NUMBER_KEY));
        }

        let table = Table::from(DbTable::from(table));
        let mut seats = seats
            .into_iter()
            .map(|s| Seat::try_from(DbSeat::from(s)))
            .collect::<Result<Vec<_>, _>>()?;
        seats.sort_by_key(|s| s.seat_number);

        inner.table_numbers.insert(table.table_number, table.id);
        inner.tables.insert(table.id, table.clone());
        for seat in &seats {
            inner.seats.insert(seat.id, seat.clone());
        }

        Ok(TableWithSeats { table, seats })
    }

    async fn delete_table(&self, table_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock()?;

        let table_number = inner
            .tables
            .get(&table_id)
            .map(|t| t.table_number)
            .ok_or(StoreError::NotFound)?;

        let seat_ids: Vec<Uuid> = inner
            .seats
            .values()
            .filter(|s| s.table_id == table_id)
            .map(|s| s.id)
            .collect();

        if seat_ids
            .iter()
            .any(|id| inner.seats[id].status == SeatStatus::Reserved)
        {
            return Err(StoreError::Precondition("table has reserved seats"));
        }
        if seat_ids.iter().any(|id| inner.booking_by_seat.contains_key(id)) {
            return Err(StoreError::Precondition("table has booked seats"));
        }

        for id in seat_ids {
            inner.seats.remove(&id);
        }
        inner.tables.remove(&table_id);
        inner.table_numbers.remove(&table_number);

        Ok(())
    }
}
