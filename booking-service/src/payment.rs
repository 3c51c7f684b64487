use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::*;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use crate::bookings::BookingManager;
use crate::ledger::SeatLedger;
use crate::store::Receipt;

/// External card processor. A refusal is a `false`, never an error.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, method: &str, token: &str, amount: &BigDecimal) -> bool;
}

/// Stand-in processor that approves a configurable share of charges.
pub struct SimulatedGateway {
    success_rate: f64,
}

impl SimulatedGateway {
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, method: &str, _token: &str, amount: &BigDecimal) -> bool {
        let approved = rand::random::<f64>() < self.success_rate;
        info!(%method, %amount, approved, "Simulated charge");
        approved
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentConfirmation {
    pub booking_id: Uuid,
    pub payment_status: PaymentStatus,
    pub payment_amount: BigDecimal,
    pub transaction_id: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub seat_info: SeatInfo,
}

#[derive(Debug, Serialize)]
pub struct SeatInfo {
    pub seat_id: Uuid,
    pub seat_number: i32,
    pub table_number: i32,
}

#[derive(Clone)]
pub struct PaymentSettlement {
    ledger: SeatLedger,
    bookings: BookingManager,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentSettlement {
    pub fn new(ledger: SeatLedger, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            bookings: BookingManager::new(ledger.clone()),
            ledger,
            gateway,
        }
    }

    pub async fn pay(
        &self,
        caller: &Caller,
        booking_id: Uuid,
        method: &str,
        token: &str,
    ) -> Result<BookingDetails, BookingError> {
        let booking = self.bookings.owned_booking(caller, booking_id).await?;
        if booking.is_paid() {
            return Err(BookingError::AlreadyPaid);
        }

        if !self.gateway.charge(method, token, &booking.amount).await {
            warn!(%booking_id, %method, "Payment declined");
            return Err(BookingError::PaymentDeclined);
        }

        let receipt = Receipt {
            transaction_id: Uuid::new_v4().to_string(),
            paid_at: Utc::now(),
        };
        let transaction_id = receipt.transaction_id.clone();

        match self.ledger.settle(booking_id, receipt).await {
            Ok((booking, _)) => {
                info!(%booking_id, %transaction_id, amount = %booking.amount, "Payment completed");
            }
            Err(BookingError::InvalidState(_)) => {
                warn!(%booking_id, %transaction_id, "Charged a booking that was settled concurrently");
                return Err(BookingError::AlreadyPaid);
            }
            Err(BookingError::NotFound(what)) => {
                warn!(%booking_id, %transaction_id, "Charged a booking that no longer exists");
                return Err(BookingError::NotFound(what));
            }
            Err(e) => return Err(e),
        }

        self.ledger
            .store()
            .booking_details(booking_id)
            .await?
            .ok_or(BookingError::NotFound("booking"))
    }

    pub async fn confirmation(&self, caller: &Caller, booking_id: Uuid) -> Result<PaymentConfirmation, BookingError> {
        self.bookings.owned_booking(caller, booking_id).await?;
        let details = self
            .ledger
            .store()
            .booking_details(booking_id)
            .await?
            .ok_or(BookingError::NotFound("booking"))?;

        Ok(PaymentConfirmation {
            booking_id: details.booking.id,
            payment_status: details.booking.payment_status,
            payment_amount: details.booking.amount,
            transaction_id: details.booking.transaction_id,
            payment_date: details.booking.paid_at,
            seat_info: SeatInfo {
                seat_id: details.seat.seat.id,
                seat_number: details.seat.seat.seat_number,
                table_number: details.seat.table_number,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SeatStore;
    use crate::testing::Fixture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGateway {
        approve: bool,
        charges: AtomicUsize,
    }

    impl CountingGateway {
        fn new(approve: bool) -> Arc<Self> {
            Arc::new(Self {
                approve,
                charges: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PaymentGateway for CountingGateway {
        async fn charge(&self, _method: &str, _token: &str, _amount: &BigDecimal) -> bool {
            self.charges.fetch_add(1, Ordering::SeqCst);
            self.approve
        }
    }

    #[tokio::test]
    async fn successful_payment_reserves_seat_and_stamps_transaction() {
        let fx = Fixture::new().await;
        let gateway = CountingGateway::new(true);
        let payments = PaymentSettlement::new(fx.ledger.clone(), gateway.clone());
        let alice = fx.student("alice").await;
        let booking = fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();

        let paid = payments.pay(&alice, booking.id, "card", "tok_visa").await.unwrap();

        assert_eq!(paid.booking.payment_status, PaymentStatus::Completed);
        assert!(paid.booking.paid_at.is_some());
        let txn = paid.booking.transaction_id.clone().unwrap();
        assert!(Uuid::parse_str(&txn).is_ok());
        assert_eq!(paid.seat.seat.status, SeatStatus::Reserved);

        let confirmation = payments.confirmation(&alice, booking.id).await.unwrap();
        assert_eq!(confirmation.transaction_id, Some(txn));
        assert_eq!(confirmation.seat_info.table_number, 1);
    }

    #[tokio::test]
    async fn paying_twice_fails_without_charging_or_mutating() {
        let fx = Fixture::new().await;
        let gateway = CountingGateway::new(true);
        let payments = PaymentSettlement::new(fx.ledger.clone(), gateway.clone());
        let alice = fx.student("alice").await;
        let booking = fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();
        let first = payments.pay(&alice, booking.id, "card", "tok").await.unwrap();

        let err = payments.pay(&alice, booking.id, "card", "tok").await.unwrap_err();

        assert_eq!(err, BookingError::AlreadyPaid);
        assert_eq!(gateway.charges.load(Ordering::SeqCst), 1);
        let stored = fx.store.find_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(stored, first.booking);
    }

    #[tokio::test]
    async fn declined_payment_changes_nothing() {
        let fx = Fixture::new().await;
        let payments = PaymentSettlement::new(fx.ledger.clone(), CountingGateway::new(false));
        let alice = fx.student("alice").await;
        let booking = fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();

        let err = payments.pay(&alice, booking.id, "card", "tok").await.unwrap_err();

        assert_eq!(err, BookingError::PaymentDeclined);
        let stored = fx.store.find_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(stored, booking);
        assert_eq!(fx.seat_status(fx.seat(1)).await, SeatStatus::Selected);
    }

    #[tokio::test]
    async fn paying_someone_elses_booking_is_not_found() {
        let fx = Fixture::new().await;
        let gateway = CountingGateway::new(true);
        let payments = PaymentSettlement::new(fx.ledger.clone(), gateway.clone());
        let alice = fx.student("alice").await;
        let mallory = fx.student("mallory").await;
        let booking = fx.ledger.claim(fx.seat(1), alice.user_id).await.unwrap();

        let err = payments.pay(&mallory, booking.id, "card", "tok").await.unwrap_err();

        assert_eq!(err, BookingError::NotFound("booking"));
        assert_eq!(gateway.charges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn simulated_gateway_honours_extreme_rates() {
        let amount = BigDecimal::from(50);
        assert!(SimulatedGateway::new(1.0).charge("card", "tok", &amount).await);
        assert!(!SimulatedGateway::new(0.0).charge("card", "tok", &amount).await);
    }
}
