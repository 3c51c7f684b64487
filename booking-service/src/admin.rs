use serde::Serialize;
use shared::*;
use tracing::info;
use uuid::Uuid;
use crate::ledger::SeatLedger;
use crate::models::{NewSeat, NewTable};
use crate::store::StoreError;

#[derive(Debug, Serialize)]
pub struct AdminDashboard {
    #[serde(flatten)]
    pub stats: DashboardStats,
    pub tables: Vec<TableWithSeats>,
}

/// Operator entry points. Every call is refused unless the caller is an admin.
#[derive(Clone)]
pub struct AdminOverride {
    ledger: SeatLedger,
}

fn require_admin(caller: &Caller) -> Result<(), BookingError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(BookingError::Forbidden)
    }
}

impl AdminOverride {
    pub fn new(ledger: SeatLedger) -> Self {
        Self { ledger }
    }

    pub async fn force_assign(&self, caller: &Caller, user_id: Uuid, seat_id: Uuid) -> Result<BookingDetails, BookingError> {
        require_admin(caller)?;
        let booking = self.ledger.force_assign(user_id, seat_id).await?;

        self.ledger
            .store()
            .booking_details(booking.id)
            .await?
            .ok_or(BookingError::NotFound("booking"))
    }

    pub async fn set_seat_status(&self, caller: &Caller, seat_id: Uuid, status: SeatStatus) -> Result<SeatOverride, BookingError> {
        require_admin(caller)?;
        self.ledger.set_status(seat_id, status).await
    }

    pub async fn create_table(&self, caller: &Caller, spec: TableSpec) -> Result<TableWithSeats, BookingError> {
        require_admin(caller)?;
        if spec.capacity < 1 {
            return Err(BookingError::Validation("capacity must be at least 1".to_string()));
        }

        let table = NewTable {
            id: Uuid::new_v4(),
            table_number: spec.table_number,
            capacity: spec.capacity,
            position_x: spec.position_x,
            position_y: spec.position_y,
            section: spec.section,
        };
        let seats = NewSeat::for_table(table.id, table.capacity);

        let created = self
            .ledger
            .store()
            .create_table(table, seats)
            .await?;

        info!(table_id = %created.table.id, table_number = created.table.table_number, seats = created.seats.len(), "Table created");
        Ok(created)
    }

    pub async fn delete_table(&self, caller: &Caller, table_id: Uuid) -> Result<(), BookingError> {
        require_admin(caller)?;
        self.ledger
            .store()
            .delete_table(table_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => BookingError::NotFound("table"),
                other => other.into(),
            })?;

        info!(%table_id, "Table deleted");
        Ok(())
    }

    pub async fn dashboard(&self, caller: &Caller) -> Result<AdminDashboard, BookingError> {
        require_admin(caller)?;
        let store = self.ledger.store();

        Ok(AdminDashboard {
            stats: store.dashboard_stats().await?,
            tables: store.list_tables(false).await?,
        })
    }

    pub async fn bookings(&self, caller: &Caller) -> Result<Vec<Booking>, BookingError> {
        require_admin(caller)?;
        Ok(self.ledger.store().list_bookings().await?)
    }
}
