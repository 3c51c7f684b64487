diesel::table! {
    bookings (id) {
        id -> Uuid,
        user_id -> Uuid,
        seat_id -> Uuid,
        payment_status -> Varchar,
        amount -> Numeric,
        transaction_id -> Nullable<Varchar>,
        created_at -> Timestamptz,
        paid_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    seats (id) {
        id -> Uuid,
        table_id -> Uuid,
        seat_number -> Int4,
        status -> Varchar,
    }
}

diesel::table! {
    tables (id) {
        id -> Uuid,
        table_number -> Int4,
        capacity -> Int4,
        position_x -> Nullable<Float8>,
        position_y -> Nullable<Float8>,
        is_active -> Bool,
        section -> Nullable<Varchar>,
    }
}

diesel::table! {
    users (id) {
        id -> Uuid,
        email -> Varchar,
        full_name -> Varchar,
        student_id -> Nullable<Varchar>,
        role -> Varchar,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(bookings -> seats (seat_id));
diesel::joinable!(bookings -> users (user_id));
diesel::joinable!(seats -> tables (table_id));

diesel::allow_tables_to_appear_in_same_query!(
    bookings,
    seats,
    tables,
    users,
);
