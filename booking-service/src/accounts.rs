use shared::*;
use std::sync::Arc;
use tracing::info;
use crate::store::{SeatStore, StoreError, USER_EMAIL_KEY, USER_STUDENT_ID_KEY};

/// Public sign-up. Accounts created here are always students; administrators
/// are provisioned directly in the database.
#[derive(Clone)]
pub struct Accounts {
    store: Arc<dyn SeatStore>,
}

impl Accounts {
    pub fn new(store: Arc<dyn SeatStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, registration: Registration) -> Result<User, BookingError> {
        let email = registration.email.trim().to_lowercase();
        let full_name = registration.full_name.trim().to_string();
        let student_id = registration
            .student_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        if !is_plausible_email(&email) {
            return Err(BookingError::Validation("email address is not valid".to_string()));
        }
        if full_name.is_empty() {
            return Err(BookingError::Validation("full name is required".to_string()));
        }

        let user = self
            .store
            .insert_user(NewUser {
                email,
                full_name,
                student_id,
                role: UserRole::Student,
            })
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation { constraint } if constraint == USER_EMAIL_KEY => {
                    BookingError::AlreadyRegistered("email")
                }
                StoreError::UniqueViolation { constraint } if constraint == USER_STUDENT_ID_KEY => {
                    BookingError::AlreadyRegistered("student id")
                }
                other => other.into(),
            })?;

        info!(user_id = %user.id, "Student registered");
        Ok(user)
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'),
        None => false,
    }
}
