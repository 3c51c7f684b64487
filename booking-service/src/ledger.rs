//! The seat ledger: the only code path that changes `seats.status`.
//!
//! Reads made before a commit are advisory and only exist to reject hopeless
//! requests early. Whether a claim wins is decided by the store's conditional
//! update and the unique keys on `bookings.seat_id` / `bookings.user_id`.

use bigdecimal::BigDecimal;
use shared::*;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use crate::models::NewBooking;
use crate::store::{Reassignment, Receipt, SeatStore, StoreError};

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => BookingError::NotFound("record"),
            StoreError::UniqueViolation { .. } => BookingError::Conflict,
            StoreError::Precondition(reason) => BookingError::InvalidState(reason.to_string()),
            other => {
                error!("Storage failure: {}", other);
                BookingError::Unavailable(other.to_string())
            }
        }
    }
}

#[derive(Clone)]
pub struct SeatLedger {
    store: Arc<dyn SeatStore>,
    ticket_price: BigDecimal,
}

impl SeatLedger {
    pub fn new(store: Arc<dyn SeatStore>, ticket_price: BigDecimal) -> Self {
        Self { store, ticket_price }
    }

    pub fn store(&self) -> &Arc<dyn SeatStore> {
        &self.store
    }

    /// Tentatively gives `seat_id` to `user_id`: seat `available -> selected` plus a
    /// pending booking, committed together. Losing a race is always `Conflict`.
    pub async fn claim(&self, seat_id: Uuid, user_id: Uuid) -> Result<Booking, BookingError> {
        let seat = self
            .store
            .find_seat(seat_id)
            .await?
            .ok_or(BookingError::NotFound("seat"))?;
        self.store
            .find_user(user_id)
            .await?
            .ok_or(BookingError::NotFound("user"))?;

        if seat.status != SeatStatus::Available {
            return Err(BookingError::Conflict);
        }

        let pending = NewBooking::pending(user_id, seat_id, self.ticket_price.clone());
        match self.store.commit_claim(pending).await {
            Ok(booking) => {
                info!(booking_id = %booking.id, %seat_id, %user_id, "Seat selected");
                Ok(booking)
            }
            Err(err @ (StoreError::UniqueViolation { .. } | StoreError::Precondition(_))) => {
                warn!(%seat_id, %user_id, reason = %err, "Seat claim lost a race");
                if let Err(e) = self.reconcile_seat(seat_id).await {
                    error!(%seat_id, "Failed to re-verify seat after conflict: {}", e);
                }
                Err(BookingError::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Finalizes a paid booking: seat `selected -> reserved`.
    pub async fn settle(&self, booking_id: Uuid, receipt: Receipt) -> Result<(Booking, Seat), BookingError> {
        let booking = self
            .store
            .find_booking(booking_id)
            .await?
            .ok_or(BookingError::NotFound("booking"))?;
        if booking.is_paid() {
            return Err(BookingError::InvalidState("booking already completed".to_string()));
        }

        let (booking, seat) = self
            .store
            .commit_settlement(booking_id, receipt)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => BookingError::NotFound("booking"),
                other => other.into(),
            })?;

        info!(%booking_id, seat_id = %seat.id, "Seat reserved");
        Ok((booking, seat))
    }

    /// Cancels an unpaid booking and returns its seat to `available`.
    pub async fn release(&self, booking_id: Uuid) -> Result<Seat, BookingError> {
        let booking = self
            .store
            .find_booking(booking_id)
            .await?
            .ok_or(BookingError::NotFound("booking"))?;
        if booking.is_paid() {
            return Err(BookingError::InvalidState(
                "cannot cancel a paid booking, contact an administrator for refunds".to_string(),
            ));
        }

        let (_, seat) = self
            .store
            .commit_release(booking_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => BookingError::NotFound("booking"),
                StoreError::Precondition(_) => BookingError::InvalidState(
                    "cannot cancel a paid booking, contact an administrator for refunds".to_string(),
                ),
                other => other.into(),
            })?;

        info!(%booking_id, seat_id = %seat.id, "Seat released");
        Ok(seat)
    }

    /// Administrator assignment: whoever held the seat loses it and the user's
    /// previous seat is freed.
    pub async fn force_assign(&self, user_id: Uuid, seat_id: Uuid) -> Result<Booking, BookingError> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or(BookingError::NotFound("user"))?;
        self.store
            .find_seat(seat_id)
            .await?
            .ok_or(BookingError::NotFound("seat"))?;

        let Reassignment { booking, evicted } = self
            .store
            .commit_force_assign(user_id, seat_id, self.ticket_price.clone())
            .await
            .map_err(|e| match e {
                StoreError::NotFound => BookingError::NotFound("seat or user"),
                other => other.into(),
            })?;

        if let Some(evicted) = evicted {
            warn!(
                %seat_id,
                evicted_booking = %evicted.id,
                evicted_user = %evicted.user_id,
                payment_status = %evicted.payment_status,
                amount = %evicted.amount,
                "Occupied seat reassigned"
            );
        }
        info!(booking_id = %booking.id, %seat_id, %user_id, "Seat assigned by administrator");
        Ok(booking)
    }

    /// Administrator override of a seat's status. Freeing or blocking a held
    /// seat deletes its booking, paid or not, and hands that booking back.
    pub async fn set_status(&self, seat_id: Uuid, status: SeatStatus) -> Result<SeatOverride, BookingError> {
        let before = self
            .store
            .find_seat(seat_id)
            .await?
            .ok_or(BookingError::NotFound("seat"))?;

        let (seat, evicted) = self
            .store
            .commit_seat_status(seat_id, status)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => BookingError::NotFound("seat"),
                other => other.into(),
            })?;

        if let Some(booking) = &evicted {
            warn!(
                %seat_id,
                booking_id = %booking.id,
                user_id = %booking.user_id,
                payment_status = %booking.payment_status,
                amount = %booking.amount,
                "Booking removed by seat status override"
            );
        }
        info!(%seat_id, from = %before.status, to = %seat.status, "Seat status overridden");
        Ok(SeatOverride { seat, evicted })
    }

    /// Resets a held seat nobody has a booking for. Returns whether anything changed.
    pub async fn reconcile_seat(&self, seat_id: Uuid) -> Result<bool, BookingError> {
        match self.store.repair_seat(seat_id).await? {
            Some(seat) => {
                warn!(%seat_id, status = %seat.status, "Orphaned seat reset");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::testing::Fixture;
    use futures::future::join_all;

    fn receipt() -> Receipt {
        Receipt {
            transaction_id: Uuid::new_v4().to_string(),
            paid_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_selects_seat_and_creates_pending_booking() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        let seat = fx.seat(1);

        let booking = fx.ledger.claim(seat, alice.user_id).await.unwrap();

        assert_eq!(booking.payment_status, PaymentStatus::Pending);
        assert_eq!(booking.amount, crate::testing::ticket_price());
        assert_eq!(fx.seat_status(seat).await, SeatStatus::Selected);
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn claim_unknown_seat_or_user_is_not_found() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;

        let err = fx.ledger.claim(Uuid::new_v4(), alice.user_id).await.unwrap_err();
        assert_eq!(err, BookingError::NotFound("seat"));

        let err = fx.ledger.claim(fx.seat(1), Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, BookingError::NotFound("user"));
    }

    #[tokio::test]
    async fn blocked_seat_cannot_be_claimed() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        let seat = fx.seat(2);
        fx.ledger.set_status(seat, SeatStatus::Blocked).await.unwrap();

        let err = fx.ledger.claim(seat, alice.user_id).await.unwrap_err();

        assert_eq!(err, BookingError::Conflict);
        assert_eq!(fx.seat_status(seat).await, SeatStatus::Blocked);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_on_one_seat_have_a_single_winner() {
        let fx = Fixture::new().await;
        let seat = fx.seat(1);
        let mut users = Vec::new();
        for i in 0..32 {
            users.push(fx.student(&format!("racer{}", i)).await);
        }

        let attempts = users.iter().map(|caller| {
            let ledger = fx.ledger.clone();
            let user_id = caller.user_id;
            tokio::spawn(async move { ledger.claim(seat, user_id).await })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| *e == BookingError::Conflict));
        assert_eq!(fx.seat_status(seat).await, SeatStatus::Selected);
        fx.assert_consistent().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_by_one_user_leave_one_booking() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;

        let attempts = (1..=8).map(|n| {
            let ledger = fx.ledger.clone();
            let seat = fx.seat(n);
            tokio::spawn(async move { ledger.claim(seat, alice.user_id).await })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let bookings = fx.store.list_bookings().await.unwrap();
        assert_eq!(bookings.iter().filter(|b| b.user_id == alice.user_id).count(), 1);
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn lost_race_rolls_back_seat_and_keeps_existing_booking() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        let bob = fx.student("bob").await;
        let seat = fx.seat(3);
        fx.ledger.claim(seat, alice.user_id).await.unwrap();

        // Stale status: the advisory read passes, the seat key must still refuse.
        fx.store.overwrite_seat_status(seat, SeatStatus::Available);
        let err = fx.ledger.claim(seat, bob.user_id).await.unwrap_err();

        assert_eq!(err, BookingError::Conflict);
        let booking = fx.store.booking_for_seat(seat).await.unwrap().unwrap();
        assert_eq!(booking.user_id, alice.user_id);
        assert!(fx.store.booking_for_user(bob.user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_frees_orphaned_seat_only() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();
        fx.store.overwrite_seat_status(fx.seat(2), SeatStatus::Selected);

        assert!(!fx.ledger.reconcile_seat(fx.seat(1)).await.unwrap());
        assert!(fx.ledger.reconcile_seat(fx.seat(2)).await.unwrap());
        assert_eq!(fx.seat_status(fx.seat(2)).await, SeatStatus::Available);
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn settle_reserves_seat_once() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        let booking = fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();

        let (paid, seat) = fx.ledger.settle(booking.id, receipt()).await.unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Completed);
        assert!(paid.transaction_id.is_some());
        assert!(paid.paid_at.is_some());
        assert_eq!(seat.status, SeatStatus::Reserved);

        let err = fx.ledger.settle(booking.id, receipt()).await.unwrap_err();
        assert!(matches!(err, BookingError::InvalidState(_)));
    }

    #[tokio::test]
    async fn release_frees_pending_booking_but_not_paid_one() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        let bob = fx.student("bob").await;

        let pending = fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();
        let seat = fx.ledger.release(pending.id).await.unwrap();
        assert_eq!(seat.status, SeatStatus::Available);
        assert!(fx.store.find_booking(pending.id).await.unwrap().is_none());

        let paid = fx.ledger.claim(fx.seat(2), bob.user_id).await.unwrap();
        fx.ledger.settle(paid.id, receipt()).await.unwrap();
        let err = fx.ledger.release(paid.id).await.unwrap_err();
        assert!(matches!(err, BookingError::InvalidState(_)));
        assert_eq!(fx.seat_status(fx.seat(2)).await, SeatStatus::Reserved);
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn force_assign_moves_user_and_frees_old_seat() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();

        let booking = fx.ledger.force_assign(alice.user_id, fx.seat(5)).await.unwrap();

        assert_eq!(booking.seat_id, fx.seat(5));
        assert_eq!(booking.payment_status, PaymentStatus::Completed);
        assert_eq!(fx.seat_status(fx.seat(1)).await, SeatStatus::Available);
        assert_eq!(fx.seat_status(fx.seat(5)).await, SeatStatus::Reserved);
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn force_assign_requires_existing_seat_and_user() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;

        let err = fx.ledger.force_assign(alice.user_id, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err, BookingError::NotFound("seat"));
        let err = fx.ledger.force_assign(Uuid::new_v4(), fx.seat(1)).await.unwrap_err();
        assert_eq!(err, BookingError::NotFound("user"));
    }

    #[tokio::test]
    async fn set_status_keeps_seats_and_bookings_in_step() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        let booking = fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();

        let blocked = fx.ledger.set_status(fx.seat(1), SeatStatus::Blocked).await.unwrap();
        assert_eq!(blocked.seat.status, SeatStatus::Blocked);
        assert_eq!(blocked.evicted, Some(booking.clone()));
        assert!(fx.store.find_booking(booking.id).await.unwrap().is_none());

        let err = fx.ledger.set_status(fx.seat(2), SeatStatus::Reserved).await.unwrap_err();
        assert!(matches!(err, BookingError::InvalidState(_)));

        let freed = fx.ledger.set_status(fx.seat(1), SeatStatus::Available).await.unwrap();
        assert_eq!(freed.seat.status, SeatStatus::Available);
        assert_eq!(freed.evicted, None);
        fx.assert_consistent().await;
    }

    #[tokio::test]
    async fn force_assign_onto_occupied_seat_moves_existing_booking() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        let bob = fx.student("bob").await;
        let alice_booking = fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();
        let bob_booking = fx.ledger.claim(fx.seat(6), bob.user_id).await.unwrap();
        fx.ledger.settle(bob_booking.id, receipt()).await.unwrap();

        let moved = fx.ledger.force_assign(alice.user_id, fx.seat(6)).await.unwrap();

        assert_eq!(moved.id, alice_booking.id);
        assert_eq!(moved.seat_id, fx.seat(6));
        assert_eq!(moved.payment_status, PaymentStatus::Completed);
        assert!(moved.paid_at.is_some());
        assert_eq!(fx.seat_status(fx.seat(1)).await, SeatStatus::Available);
        assert_eq!(fx.seat_status(fx.seat(6)).await, SeatStatus::Reserved);
        assert!(fx.store.find_booking(bob_booking.id).await.unwrap().is_none());
        assert!(fx.store.booking_for_user(bob.user_id).await.unwrap().is_none());
        assert_eq!(
            fx.store.booking_for_seat(fx.seat(6)).await.unwrap().map(|b| b.user_id),
            Some(alice.user_id)
        );
        assert!(fx.store.booking_for_seat(fx.seat(1)).await.unwrap().is_none());
        fx.assert_consistent().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn release_and_block_racing_on_one_seat_both_resolve_cleanly() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;

        for _ in 0..20 {
            let booking = fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();

            let release = {
                let ledger = fx.ledger.clone();
                tokio::spawn(async move { ledger.release(booking.id).await })
            };
            let block = {
                let ledger = fx.ledger.clone();
                let seat = fx.seat(1);
                tokio::spawn(async move { ledger.set_status(seat, SeatStatus::Blocked).await })
            };

            match release.await.unwrap() {
                Ok(_) | Err(BookingError::NotFound(_)) => {}
                Err(other) => panic!("release failed with {:?}", other),
            }
            assert!(block.await.unwrap().is_ok());
            fx.assert_consistent().await;

            fx.ledger.set_status(fx.seat(1), SeatStatus::Available).await.unwrap();
        }
    }
}
