use serde::Serialize;
use shared::*;
use tracing::info;
use uuid::Uuid;
use crate::ledger::SeatLedger;

#[derive(Debug, Serialize)]
pub struct StudentDashboard {
    pub user: User,
    pub booking: Option<BookingDetails>,
    pub available_tables: Vec<TableWithSeats>,
}

/// Student-facing booking flow. Enforces one booking per user on top of the
/// ledger; the `AlreadyBooked` check here only short-circuits the common case,
/// the user key in the store settles real races.
#[derive(Clone)]
pub struct BookingManager {
    ledger: SeatLedger,
}

impl BookingManager {
    pub fn new(ledger: SeatLedger) -> Self {
        Self { ledger }
    }

    pub async fn book(&self, caller: &Caller, seat_id: Uuid) -> Result<BookingDetails, BookingError> {
        if self.ledger.store().booking_for_user(caller.user_id).await?.is_some() {
            return Err(BookingError::AlreadyBooked);
        }

        let booking = self.ledger.claim(seat_id, caller.user_id).await?;
        info!(booking_id = %booking.id, user_id = %caller.user_id, "Booking created");

        self.details(booking.id).await
    }

    pub async fn cancel(&self, caller: &Caller, booking_id: Uuid) -> Result<(), BookingError> {
        self.owned_booking(caller, booking_id).await?;
        self.ledger.release(booking_id).await?;

        info!(%booking_id, user_id = %caller.user_id, "Booking cancelled");
        Ok(())
    }

    pub async fn my_booking(&self, caller: &Caller) -> Result<BookingDetails, BookingError> {
        let booking = self
            .ledger
            .store()
            .booking_for_user(caller.user_id)
            .await?
            .ok_or(BookingError::NotFound("booking"))?;

        self.details(booking.id).await
    }

    pub async fn available_tables(&self) -> Result<Vec<TableWithSeats>, BookingError> {
        Ok(self.ledger.store().list_tables(true).await?)
    }

    pub async fn dashboard(&self, caller: &Caller) -> Result<StudentDashboard, BookingError> {
        let store = self.ledger.store();
        let user = store
            .find_user(caller.user_id)
            .await?
            .ok_or(BookingError::NotFound("user"))?;

        let booking = match store.booking_for_user(caller.user_id).await? {
            Some(booking) => store.booking_details(booking.id).await?,
            None => None,
        };

        Ok(StudentDashboard {
            user,
            booking,
            available_tables: store.list_tables(true).await?,
        })
    }

    /// The booking, if it exists and belongs to the caller.
    pub async fn owned_booking(&self, caller: &Caller, booking_id: Uuid) -> Result<Booking, BookingError> {
        self.ledger
            .store()
            .find_booking(booking_id)
            .await?
            .filter(|b| b.user_id == caller.user_id)
            .ok_or(BookingError::NotFound("booking"))
    }

    async fn details(&self, booking_id: Uuid) -> Result<BookingDetails, BookingError> {
        self.ledger
            .store()
            .booking_details(booking_id)
            .await?
            .ok_or(BookingError::NotFound("booking"))
    }
}
