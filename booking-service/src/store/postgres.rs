use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use num_traits::Zero;
use shared::*;
use shared::Table;
use uuid::Uuid;
use crate::models::*;
use crate::schema::*;
use super::{group_tables, Reassignment, Receipt, SeatStore, StoreError};

type DbPool = Pool<AsyncPgConnection>;

const AVAILABLE: &str = SeatStatus::Available.as_str();
const SELECTED: &str = SeatStatus::Selected.as_str();
const RESERVED: &str = SeatStatus::Reserved.as_str();
const PENDING: &str = PaymentStatus::Pending.as_str();
const COMPLETED: &str = PaymentStatus::Completed.as_str();

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, StoreError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl SeatStore for PgStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn().await?;
        users::table
            .find(user_id)
            .first::<DbUser>(&mut conn)
            .await
            .optional()?
            .map(User::try_from)
            .transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn().await?;
        users::table
            .filter(users::email.eq(email))
            .first::<DbUser>(&mut conn)
            .await
            .optional()?
            .map(User::try_from)
            .transpose()
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut conn = self.conn().await?;
        let row = DbUser {
            id: Uuid::new_v4(),
            email: user.email,
            full_name: user.full_name,
            student_id: user.student_id,
            role: user.role.as_str().to_string(),
            is_active: true,
            created_at: Utc::now(),
        };

        let row = diesel::insert_into(users::table)
            .values(&row)
            .get_result::<DbUser>(&mut conn)
            .await?;

        User::try_from(row)
    }

    async fn find_seat(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError> {
        let mut conn = self.conn().await?;
        seats::table
            .find(seat_id)
            .first::<DbSeat>(&mut conn)
            .await
            .optional()?
            .map(Seat::try_from)
            .transpose()
    }

    async fn find_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        bookings::table
            .find(booking_id)
            .first::<DbBooking>(&mut conn)
            .await
            .optional()?
            .map(Booking::try_from)
            .transpose()
    }

    async fn booking_for_user(&self, user_id: Uuid) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        bookings::table
            .filter(bookings::user_id.eq(user_id))
            .first::<DbBooking>(&mut conn)
            .await
            .optional()?
            .map(Booking::try_from)
            .transpose()
    }

    async fn booking_for_seat(&self, seat_id: Uuid) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        bookings::table
            .filter(bookings::seat_id.eq(seat_id))
            .first::<DbBooking>(&mut conn)
            .await
            .optional()?
            .map(Booking::try_from)
            .transpose()
    }

    async fn booking_details(&self, booking_id: Uuid) -> Result<Option<BookingDetails>, StoreError> {
        let mut conn = self.conn().await?;
        let row = bookings::table
            .inner_join(seats::table.inner_join(tables::table))
            .filter(bookings::id.eq(booking_id))
            .select((bookings::all_columns, seats::all_columns, tables::table_number))
            .first::<(DbBooking, DbSeat, i32)>(&mut conn)
            .await
            .optional()?;

        match row {
            Some((booking, seat, table_number)) => Ok(Some(BookingDetails {
                booking: Booking::try_from(booking)?,
                seat: SeatView {
                    seat: Seat::try_from(seat)?,
                    table_number,
                },
            })),
            None => Ok(None),
        }
    }

    async fn list_tables(&self, active_only: bool) -> Result<Vec<TableWithSeats>, StoreError> {
        let mut conn = self.conn().await?;

        let mut query = tables::table
            .order(tables::table_number.asc())
            .into_boxed::<diesel::pg::Pg>();
        if active_only {
            query = query.filter(tables::is_active.eq(true));
        }
        let table_rows = query.load::<DbTable>(&mut conn).await?;

        let table_ids: Vec<Uuid> = table_rows.iter().map(|t| t.id).collect();
        let seat_rows = seats::table
            .filter(seats::table_id.eq_any(table_ids))
            .order((seats::table_id.asc(), seats::seat_number.asc()))
            .load::<DbSeat>(&mut conn)
            .await?;

        let seats = seat_rows
            .into_iter()
            .map(Seat::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(group_tables(table_rows.into_iter().map(Table::from).collect(), seats))
    }

    async fn list_bookings(&self) -> Result<Vec<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        bookings::table
            .order(bookings::created_at.asc())
            .load::<DbBooking>(&mut conn)
            .await?
            .into_iter()
            .map(Booking::try_from)
            .collect()
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError> {
        let mut conn = self.conn().await?;

        let total_seats = seats::table.count().get_result::<i64>(&mut conn).await?;
        let available_seats = seats::table
            .filter(seats::status.eq(AVAILABLE))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        let reserved_seats = seats::table
            .filter(seats::status.eq(RESERVED))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        let pending_payments = bookings::table
            .filter(bookings::payment_status.eq(PENDING))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        let total_revenue = bookings::table
            .filter(bookings::payment_status.eq(COMPLETED))
            .select(diesel::dsl::sum(bookings::amount))
            .first::<Option<BigDecimal>>(&mut conn)
            .await?
            .unwrap_or_else(BigDecimal::zero);

        Ok(DashboardStats {
            total_seats,
            available_seats,
            reserved_seats,
            pending_payments,
            total_revenue,
        })
    }

    async fn commit_claim(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                // Row lock plus re-check of the status: a racing claimer that
                // committed first leaves this update with nothing to match.
                let claimed = diesel::update(
                    seats::table
                        .filter(seats::id.eq(booking.seat_id))
                        .filter(seats::status.eq(AVAILABLE)),
                )
                .set(seats::status.eq(SELECTED))
                .execute(conn)
                .await?;

                if claimed == 0 {
                    return Err(StoreError::Precondition("seat is not available"));
                }

                let row = diesel::insert_into(bookings::table)
                    .values(&booking)
                    .get_result::<DbBooking>(conn)
                    .await?;

                Booking::try_from(row)
            })
        })
        .await
    }

    async fn commit_settlement(&self, booking_id: Uuid, receipt: Receipt) -> Result<(Booking, Seat), StoreError> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let seat_id = bookings::table
                    .find(booking_id)
                    .select(bookings::seat_id)
                    .get_result::<Uuid>(conn)
                    .await
                    .optional()?
                    .ok_or(StoreError::NotFound)?;

                // Seat row before booking row, the same order every writer uses.
                seats::table
                    .find(seat_id)
                    .for_update()
                    .get_result::<DbSeat>(conn)
                    .await?;

                let settled = diesel::update(
                    bookings::table
                        .filter(bookings::id.eq(booking_id))
                        .filter(bookings::seat_id.eq(seat_id))
                        .filter(bookings::payment_status.ne(COMPLETED)),
                )
                .set((
                    bookings::payment_status.eq(COMPLETED),
                    bookings::transaction_id.eq(Some(receipt.transaction_id)),
                    bookings::paid_at.eq(Some(receipt.paid_at)),
                ))
                .get_result::<DbBooking>(conn)
                .await
                .optional()?;

                let settled = match settled {
                    Some(row) => row,
                    None => {
                        let exists = bookings::table
                            .find(booking_id)
                            .count()
                            .get_result::<i64>(conn)
                            .await?;
                        return Err(if exists > 0 {
                            StoreError::Precondition("booking already completed")
                        } else {
                            StoreError::NotFound
                        });
                    }
                };

                let seat = diesel::update(seats::table.find(seat_id))
                    .set(seats::status.eq(RESERVED))
                    .get_result::<DbSeat>(conn)
                    .await?;

                Ok((Booking::try_from(settled)?, Seat::try_from(seat)?))
            })
        })
        .await
    }

    async fn commit_release(&self, booking_id: Uuid) -> Result<(Booking, Seat), StoreError> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let seat_id = bookings::table
                    .find(booking_id)
                    .select(bookings::seat_id)
                    .get_result::<Uuid>(conn)
                    .await
                    .optional()?
                    .ok_or(StoreError::NotFound)?;

                seats::table
                    .find(seat_id)
                    .for_update()
                    .get_result::<DbSeat>(conn)
                    .await?;

                let released = diesel::delete(
                    bookings::table
                        .filter(bookings::id.eq(booking_id))
                        .filter(bookings::seat_id.eq(seat_id))
                        .filter(bookings::payment_status.ne(COMPLETED)),
                )
                .get_result::<DbBooking>(conn)
                .await
                .optional()?;

                let released = match released {
                    Some(row) => row,
                    None => {
                        let exists = bookings::table
                            .find(booking_id)
                            .count()
                            .get_result::<i64>(conn)
                            .await?;
                        return Err(if exists > 0 {
                            StoreError::Precondition("booking already completed")
                        } else {
                            StoreError::NotFound
                        });
                    }
                };

                let seat = diesel::update(seats::table.find(seat_id))
                    .set(seats::status.eq(AVAILABLE))
                    .get_result::<DbSeat>(conn)
                    .await?;

                Ok((Booking::try_from(released)?, Seat::try_from(seat)?))
            })
        })
        .await
    }

    async fn commit_force_assign(&self, user_id: Uuid, seat_id: Uuid, amount: BigDecimal) -> Result<Reassignment, StoreError> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let previous_seat = bookings::table
                    .filter(bookings::user_id.eq(user_id))
                    .select(bookings::seat_id)
                    .get_result::<Uuid>(conn)
                    .await
                    .optional()?;

                // Both seats are locked in id order.
                let mut seat_ids = vec![seat_id];
                seat_ids.extend(previous_seat.filter(|id| *id != seat_id));
                seat_ids.sort();
                for id in &seat_ids {
                    seats::table
                        .find(*id)
                        .for_update()
                        .get_result::<DbSeat>(conn)
                        .await
                        .optional()?
                        .ok_or(StoreError::NotFound)?;
                }

                let user_exists = users::table
                    .find(user_id)
                    .count()
                    .get_result::<i64>(conn)
                    .await?;
                if user_exists == 0 {
                    return Err(StoreError::NotFound);
                }

                let own = bookings::table
                    .filter(bookings::user_id.eq(user_id))
                    .for_update()
                    .get_result::<DbBooking>(conn)
                    .await
                    .optional()?;
                if let Some(own) = &own {
                    if !seat_ids.contains(&own.seat_id) {
                        return Err(StoreError::Precondition("user's booking moved during reassignment"));
                    }
                }

                let occupant = bookings::table
                    .filter(bookings::seat_id.eq(seat_id))
                    .filter(bookings::user_id.ne(user_id))
                    .for_update()
                    .get_result::<DbBooking>(conn)
                    .await
                    .optional()?;

                let evicted = match occupant {
                    Some(occupant) => Some(
                        diesel::delete(bookings::table.find(occupant.id))
                            .get_result::<DbBooking>(conn)
                            .await?,
                    ),
                    None => None,
                };

                let row = match own {
                    Some(own) => {
                        if own.seat_id != seat_id {
                            diesel::update(seats::table.find(own.seat_id))
                                .set(seats::status.eq(AVAILABLE))
                                .execute(conn)
                                .await?;
                        }
                        diesel::update(bookings::table.find(own.id))
                            .set((
                                bookings::seat_id.eq(seat_id),
                                bookings::payment_status.eq(COMPLETED),
                                bookings::paid_at.eq(own.paid_at.or(Some(Utc::now()))),
                            ))
                            .get_result::<DbBooking>(conn)
                            .await?
                    }
                    None => {
                        diesel::insert_into(bookings::table)
                            .values(&NewBooking::assigned(user_id, seat_id, amount))
                            .get_result::<DbBooking>(conn)
                            .await?
                    }
                };

                diesel::update(seats::table.find(seat_id))
                    .set(seats::status.eq(RESERVED))
                    .execute(conn)
                    .await?;

                Ok(Reassignment {
                    booking: Booking::try_from(row)?,
                    evicted: evicted.map(Booking::try_from).transpose()?,
                })
            })
        })
        .await
    }

    async fn commit_seat_status(&self, seat_id: Uuid, status: SeatStatus) -> Result<(Seat, Option<Booking>), StoreError> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                seats::table
                    .find(seat_id)
                    .for_update()
                    .get_result::<DbSeat>(conn)
                    .await
                    .optional()?
                    .ok_or(StoreError::NotFound)?;

                let booking = bookings::table
                    .filter(bookings::seat_id.eq(seat_id))
                    .first::<DbBooking>(conn)
                    .await
                    .optional()?;

                let evicted = match (status.is_held(), booking) {
                    (false, Some(booking)) => Some(
                        diesel::delete(bookings::table.find(booking.id))
                            .get_result::<DbBooking>(conn)
                            .await?,
                    ),
                    (true, None) => {
                        return Err(StoreError::Precondition("seat has no booking to hold it"));
                    }
                    _ => None,
                };

                let row = diesel::update(seats::table.find(seat_id))
                    .set(seats::status.eq(status.as_str()))
                    .get_result::<DbSeat>(conn)
                    .await?;

                Ok((Seat::try_from(row)?, evicted.map(Booking::try_from).transpose()?))
            })
        })
        .await
    }

    async fn repair_seat(&self, seat_id: Uuid) -> Result<Option<Seat>, StoreError> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                // Every booking writer locks the seat row first, so holding
                // it keeps the booking check below stable.
                let seat = seats::table
                    .find(seat_id)
                    .for_update()
                    .get_result::<DbSeat>(conn)
                    .await
                    .optional()?;
                let held = match seat {
                    Some(seat) => seat.status == SELECTED || seat.status == RESERVED,
                    None => false,
                };
                if !held {
                    return Ok(None);
                }

                let referenced = bookings::table
                    .filter(bookings::seat_id.eq(seat_id))
                    .count()
                    .get_result::<i64>(conn)
                    .await?;
                if referenced > 0 {
                    return Ok(None);
                }

                let row = diesel::update(seats::table.find(seat_id))
                    .set(seats::status.eq(AVAILABLE))
                    .get_result::<DbSeat>(conn)
                    .await?;

                Seat::try_from(row).map(Some)
            })
        })
        .await
    }

    async fn create_table(&self, table: NewTable, seats: Vec<NewSeat>) -> Result<TableWithSeats, StoreError> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let table_row = diesel::insert_into(tables::table)
                    .values(&table)
                    .get_result::<DbTable>(conn)
                    .await?;

                let seat_rows = diesel::insert_into(seats::table)
                    .values(&seats)
                    .get_results::<DbSeat>(conn)
                    .await?;

                let mut seats = seat_rows
                    .into_iter()
                    .map(Seat::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                seats.sort_by_key(|s| s.seat_number);

                Ok(TableWithSeats {
                    table: Table::from(table_row),
                    seats,
                })
            })
        })
        .await
    }

    async fn delete_table(&self, table_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                tables::table
                    .find(table_id)
                    .for_update()
                    .get_result::<DbTable>(conn)
                    .await
                    .optional()?
                    .ok_or(StoreError::NotFound)?;

                let seat_rows = seats::table
                    .filter(seats::table_id.eq(table_id))
                    .for_update()
                    .load::<DbSeat>(conn)
                    .await?;

                if seat_rows.iter().any(|s| s.status == RESERVED) {
                    return Err(StoreError::Precondition("table has reserved seats"));
                }

                let seat_ids: Vec<Uuid> = seat_rows.iter().map(|s| s.id).collect();
                let booked = bookings::table
                    .filter(bookings::seat_id.eq_any(seat_ids))
                    .count()
                    .get_result::<i64>(conn)
                    .await?;
                if booked > 0 {
                    return Err(StoreError::Precondition("table has booked seats"));
                }

                diesel::delete(seats::table.filter(seats::table_id.eq(table_id)))
                    .execute(conn)
                    .await?;
                diesel::delete(tables::table.find(table_id))
                    .execute(conn)
                    .await?;

                Ok(())
            })
        })
        .await
    }
}
