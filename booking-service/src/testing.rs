use bigdecimal::BigDecimal;
use shared::*;
use std::sync::Arc;
use uuid::Uuid;
use crate::ledger::SeatLedger;
use crate::models::{NewSeat, NewTable};
use crate::store::{MemoryStore, SeatStore};

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub ledger: SeatLedger,
    pub table: TableWithSeats,
}

impl Fixture {
    /// One table numbered 1 with eight available seats.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let table = seed_table(store.as_ref(), 1, 8).await;
        let ledger = SeatLedger::new(store.clone(), ticket_price());

        Self { store, ledger, table }
    }

    pub fn seat(&self, seat_number: i32) -> Uuid {
        self.table
            .seats
            .iter()
            .find(|s| s.seat_number == seat_number)
            .map(|s| s.id)
            .unwrap()
    }

    pub async fn student(&self, name: &str) -> Caller {
        self.user(name, UserRole::Student).await
    }

    pub async fn admin(&self, name: &str) -> Caller {
        self.user(name, UserRole::Admin).await
    }

    async fn user(&self, name: &str, role: UserRole) -> Caller {
        let user = self
            .store
            .insert_user(NewUser {
                email: format!("{}@school.test", name),
                full_name: name.to_string(),
                student_id: None,
                role,
            })
            .await
            .unwrap();

        Caller { user_id: user.id, role }
    }

    pub async fn seat_status(&self, seat_id: Uuid) -> SeatStatus {
        self.store.find_seat(seat_id).await.unwrap().unwrap().status
    }

    /// Checks that held seats and bookings line up one to one.
    pub async fn assert_consistent(&self) {
        let bookings = self.store.list_bookings().await.unwrap();
        for table in self.store.list_tables(false).await.unwrap() {
            for seat in table.seats {
                let referencing = bookings.iter().filter(|b| b.seat_id == seat.id).count();
                if seat.status.is_held() {
                    assert_eq!(referencing, 1, "held seat {} has {} bookings", seat.id, referencing);
                } else {
                    assert_eq!(referencing, 0, "free seat {} has {} bookings", seat.id, referencing);
                }
            }
        }
    }
}

pub fn ticket_price() -> BigDecimal {
    "50.00".parse().unwrap()
}

pub async fn seed_table(store: &dyn SeatStore, table_number: i32, capacity: i32) -> TableWithSeats {
    let table_id = Uuid::new_v4();
    let table = NewTable {
        id: table_id,
        table_number,
        capacity,
        position_x: Some(10.0),
        position_y: Some(20.0),
        section: Some("Main Floor".to_string()),
    };
    store.create_table(table, NewSeat::for_table(table_id, capacity)).await.unwrap()
}
