use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::*;
use std::sync::Arc;
use uuid::Uuid;
use crate::accounts::Accounts;
use crate::admin::{AdminDashboard, AdminOverride};
use crate::bookings::{BookingManager, StudentDashboard};
use crate::identity::IdentityProvider;
use crate::payment::{PaymentConfirmation, PaymentSettlement};

#[derive(Clone)]
pub struct AppState {
    pub accounts: Accounts,
    pub bookings: BookingManager,
    pub payments: PaymentSettlement,
    pub admin: AdminOverride,
    pub identity: Arc<dyn IdentityProvider>,
}

#[derive(Debug, Deserialize)]
pub struct BookSeatRequest {
    pub seat_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub booking_id: Uuid,
    pub payment_method: String,
    pub payment_token: String,
}

#[derive(Debug, Deserialize)]
pub struct SeatStatusRequest {
    pub status: SeatStatus,
}

#[derive(Debug, Deserialize)]
pub struct AssignSeatRequest {
    pub user_id: Uuid,
    pub seat_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SeatStatusResponse {
    pub message: String,
    pub seat_id: Uuid,
    pub new_status: SeatStatus,
    pub removed_booking: Option<Booking>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub struct ApiError(BookingError);

impl From<BookingError> for ApiError {
    fn from(err: BookingError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BookingError::NotFound(_) => StatusCode::NOT_FOUND,
            BookingError::Conflict => StatusCode::CONFLICT,
            BookingError::InvalidState(_)
            | BookingError::AlreadyBooked
            | BookingError::AlreadyPaid
            | BookingError::AlreadyRegistered(_)
            | BookingError::PaymentDeclined => StatusCode::BAD_REQUEST,
            BookingError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BookingError::Unauthorized => StatusCode::UNAUTHORIZED,
            BookingError::Forbidden => StatusCode::FORBIDDEN,
            BookingError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let error = match &self.0 {
            BookingError::Unavailable(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        (status, Json(ErrorResponse { error })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// The verified caller behind a `Authorization: Bearer` header.
pub struct Authenticated(pub Caller);

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(BookingError::Unauthorized)?;

        let caller = state.identity.authenticate(token.trim()).await?;
        Ok(Authenticated(caller))
    }
}

pub fn create_router(state: AppState) -> Router {
    let auth = Router::new().route("/register", post(register));

    let student = Router::new()
        .route("/dashboard", get(student_dashboard))
        .route("/tables", get(available_tables))
        .route("/book-seat", post(book_seat))
        .route("/cancel-booking/:booking_id", delete(cancel_booking))
        .route("/my-booking", get(my_booking));

    let payment = Router::new()
        .route("/process", post(process_payment))
        .route("/confirmation/:booking_id", get(payment_confirmation));

    let admin = Router::new()
        .route("/dashboard", get(admin_dashboard))
        .route("/tables", post(create_table))
        .route("/tables/:table_id", delete(delete_table))
        .route("/seats/:seat_id/status", put(update_seat_status))
        .route("/assign-seat", post(assign_seat))
        .route("/bookings", get(all_bookings));

    Router::new()
        .nest("/api/auth", auth)
        .nest("/api/student", student)
        .nest("/api/payment", payment)
        .nest("/api/admin", admin)
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn register(
    State(state): State<AppState>,
    Json(registration): Json<Registration>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = state.accounts.register(registration).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn student_dashboard(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> ApiResult<Json<StudentDashboard>> {
    Ok(Json(state.bookings.dashboard(&caller).await?))
}

pub async fn available_tables(
    State(state): State<AppState>,
    Authenticated(_caller): Authenticated,
) -> ApiResult<Json<Vec<TableWithSeats>>> {
    Ok(Json(state.bookings.available_tables().await?))
}

pub async fn book_seat(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(request): Json<BookSeatRequest>,
) -> ApiResult<(StatusCode, Json<BookingDetails>)> {
    let booking = state.bookings.book(&caller, request.seat_id).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(booking_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.bookings.cancel(&caller, booking_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn my_booking(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> ApiResult<Json<BookingDetails>> {
    Ok(Json(state.bookings.my_booking(&caller).await?))
}

pub async fn process_payment(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(request): Json<PaymentRequest>,
) -> ApiResult<Json<BookingDetails>> {
    let booking = state
        .payments
        .pay(&caller, request.booking_id, &request.payment_method, &request.payment_token)
        .await?;
    Ok(Json(booking))
}

pub async fn payment_confirmation(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(booking_id): Path<Uuid>,
) -> ApiResult<Json<PaymentConfirmation>> {
    Ok(Json(state.payments.confirmation(&caller, booking_id).await?))
}

pub async fn admin_dashboard(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> ApiResult<Json<AdminDashboard>> {
    Ok(Json(state.admin.dashboard(&caller).await?))
}

pub async fn create_table(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(spec): Json<TableSpec>,
) -> ApiResult<(StatusCode, Json<TableWithSeats>)> {
    let table = state.admin.create_table(&caller, spec).await?;
    Ok((StatusCode::CREATED, Json(table)))
}

pub async fn delete_table(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(table_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.admin.delete_table(&caller, table_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_seat_status(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(seat_id): Path<Uuid>,
    Json(request): Json<SeatStatusRequest>,
) -> ApiResult<Json<SeatStatusResponse>> {
    let SeatOverride { seat, evicted } = state.admin.set_seat_status(&caller, seat_id, request.status).await?;
    Ok(Json(SeatStatusResponse {
        message: "Seat status updated successfully".to_string(),
        seat_id: seat.id,
        new_status: seat.status,
        removed_booking: evicted,
    }))
}

pub async fn assign_seat(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Json(request): Json<AssignSeatRequest>,
) -> ApiResult<Json<BookingDetails>> {
    let booking = state
        .admin
        .force_assign(&caller, request.user_id, request.seat_id)
        .await?;
    Ok(Json(booking))
}

pub async fn all_bookings(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> ApiResult<Json<Vec<Booking>>> {
    Ok(Json(state.admin.bookings(&caller).await?))
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{issue_token, JwtIdentity};
    use crate::payment::SimulatedGateway;
    use crate::testing::Fixture;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const SECRET: &str = "api-test-secret";

    fn app(fx: &Fixture) -> Router {
        create_router(AppState {
            accounts: Accounts::new(fx.store.clone()),
            bookings: BookingManager::new(fx.ledger.clone()),
            payments: PaymentSettlement::new(fx.ledger.clone(), Arc::new(SimulatedGateway::new(1.0))),
            admin: AdminOverride::new(fx.ledger.clone()),
            identity: Arc::new(JwtIdentity::new(SECRET, fx.store.clone())),
        })
    }

    fn request(method: &str, uri: &str, email: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(email) = email {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", issue_token(SECRET, email)));
        }
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let fx = Fixture::new().await;
        let response = app(&fx)
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let fx = Fixture::new().await;
        let response = app(&fx)
            .oneshot(request("GET", "/api/student/tables", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn booking_race_loser_gets_conflict() {
        let fx = Fixture::new().await;
        fx.student("alice").await;
        fx.student("bob").await;
        let seat = fx.seat(1);
        let body = serde_json::json!({ "seat_id": seat });

        let first = app(&fx)
            .oneshot(request("POST", "/api/student/book-seat", Some("alice@school.test"), Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        let booking = json_body(first).await;
        assert_eq!(booking["payment_status"], "pending");
        assert_eq!(booking["seat"]["status"], "selected");
        assert_eq!(booking["seat"]["table_number"], 1);

        let second = app(&fx)
            .oneshot(request("POST", "/api/student/book-seat", Some("bob@school.test"), Some(body)))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert!(json_body(second).await["error"].is_string());
    }

    #[tokio::test]
    async fn pay_then_cancel_is_refused() {
        let fx = Fixture::new().await;
        fx.student("alice").await;
        let email = Some("alice@school.test");

        let booked = app(&fx)
            .oneshot(request("POST", "/api/student/book-seat", email, Some(serde_json::json!({ "seat_id": fx.seat(2) }))))
            .await
            .unwrap();
        let booking_id = json_body(booked).await["id"].as_str().unwrap().to_string();

        let pay = serde_json::json!({
            "booking_id": booking_id,
            "payment_method": "credit_card",
            "payment_token": "tok_visa",
        });
        let paid = app(&fx)
            .oneshot(request("POST", "/api/payment/process", email, Some(pay.clone())))
            .await
            .unwrap();
        assert_eq!(paid.status(), StatusCode::OK);
        assert_eq!(json_body(paid).await["payment_status"], "completed");

        let again = app(&fx)
            .oneshot(request("POST", "/api/payment/process", email, Some(pay)))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);

        let cancel = app(&fx)
            .oneshot(request("DELETE", &format!("/api/student/cancel-booking/{}", booking_id), email, None))
            .await
            .unwrap();
        assert_eq!(cancel.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_routes_check_role() {
        let fx = Fixture::new().await;
        fx.student("alice").await;
        fx.admin("root").await;

        let student = app(&fx)
            .oneshot(request("GET", "/api/admin/dashboard", Some("alice@school.test"), None))
            .await
            .unwrap();
        assert_eq!(student.status(), StatusCode::FORBIDDEN);

        let blocked = app(&fx)
            .oneshot(request(
                "PUT",
                &format!("/api/admin/seats/{}/status", fx.seat(3)),
                Some("root@school.test"),
                Some(serde_json::json!({ "status": "blocked" })),
            ))
            .await
            .unwrap();
        assert_eq!(blocked.status(), StatusCode::OK);
        assert_eq!(json_body(blocked).await["new_status"], "blocked");

        let dashboard = app(&fx)
            .oneshot(request("GET", "/api/admin/dashboard", Some("root@school.test"), None))
            .await
            .unwrap();
        let stats = json_body(dashboard).await;
        assert_eq!(stats["total_seats"], 8);
        assert_eq!(stats["available_seats"], 7);
    }

    #[tokio::test]
    async fn registered_student_can_book_right_away() {
        let fx = Fixture::new().await;
        let body = serde_json::json!({
            "email": "lee@school.test",
            "full_name": "Lee Morgan",
            "student_id": "S-3003",
        });

        let created = app(&fx)
            .oneshot(request("POST", "/api/auth/register", None, Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let user = json_body(created).await;
        assert_eq!(user["role"], "student");

        let duplicate = app(&fx)
            .oneshot(request("POST", "/api/auth/register", None, Some(body)))
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(duplicate).await["error"], "email already registered");

        let booked = app(&fx)
            .oneshot(request(
                "POST",
                "/api/student/book-seat",
                Some("lee@school.test"),
                Some(serde_json::json!({ "seat_id": fx.seat(5) })),
            ))
            .await
            .unwrap();
        assert_eq!(booked.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn blocking_a_booked_seat_reports_the_removed_booking() {
        let fx = Fixture::new().await;
        let alice = fx.student("alice").await;
        fx.admin("root").await;
        let booking = fx.ledger.claim(fx.seat(7), alice.user_id).await.unwrap();

        let response = app(&fx)
            .oneshot(request(
                "PUT",
                &format!("/api/admin/seats/{}/status", fx.seat(7)),
                Some("root@school.test"),
                Some(serde_json::json!({ "status": "blocked" })),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["new_status"], "blocked");
        assert_eq!(body["removed_booking"]["id"], booking.id.to_string());
    }
}
