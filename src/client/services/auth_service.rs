use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use reqwest::Method;

use crate::client::services::http::{ApiClient, ApiError, ApiResult};
use crate::client::utils::session_store::{Session, SessionStore};
use crate::common::models::{
    AuthPayload, ChangePasswordRequest, LoginRequest, RegisterRequest,
};

/// Login, registration and account recovery. Successful logins and
/// registrations are persisted through the session store.
pub struct AuthService {
    api: ApiClient,
    store: Arc<dyn SessionStore>,
}

impl AuthService {
    pub fn new(api: ApiClient, store: Arc<dyn SessionStore>) -> Self {
        Self { api, store }
    }

    /// Stored session, unless it has expired.
    pub fn current_session(&self) -> ApiResult<Option<Session>> {
        Ok(self.store.load_active(Utc::now().timestamp_millis())?)
    }

    pub async fn login(&self, email: &str, password: &str) -> ApiResult<Session> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let payload: AuthPayload = self
            .api
            .post_json(&["auth", "login"], &request, "Login failed")
            .await
            .map_err(|e| remap_server_message(e, "USER_NOT_VERIFIED", "User is not verified."))?;
        self.persist(payload)
    }

    pub async fn register(&self, request: &RegisterRequest) -> ApiResult<Session> {
        let payload: AuthPayload = self
            .api
            .post_json(
                &["auth", "register"],
                request,
                "Registration failed. Please try again.",
            )
            .await
            .map_err(|e| {
                remap_server_message(
                    e,
                    "USER_ALREADY_EXISTS",
                    "This email is already registered. Please login or use a different email.",
                )
            })?;
        info!("[AUTH] Signup successful, verification email sent to {}", payload.email);
        self.persist(payload)
    }

    pub fn logout(&self) -> ApiResult<()> {
        self.store.clear()?;
        info!("[AUTH] Logged out");
        Ok(())
    }

    /// Returns the server's confirmation text.
    pub async fn resend_verification_email(&self, email: &str) -> ApiResult<String> {
        let builder = self
            .api
            .request(Method::POST, &["auth", "resend-verification-email"])?
            .query(&[("email", email)]);
        let envelope = self
            .api
            .send_enveloped::<serde_json::Value>(builder, "Failed to resend verification email")
            .await?;
        Ok(envelope
            .message
            .unwrap_or_else(|| "Verification email sent successfully!".to_string()))
    }

    pub async fn forgot_password(&self, email: &str) -> ApiResult<String> {
        let builder = self
            .api
            .request(Method::POST, &["auth", "forgot-password"])?
            .query(&[("email", email)]);
        self.api
            .send_data(builder, "Failed to send password reset link")
            .await
    }

    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> ApiResult<String> {
        let builder = self
            .api
            .request(Method::POST, &["auth", "reset-password"])?
            .query(&[
                ("token", token),
                ("newPassword", new_password),
                ("confirmPassword", confirm_password),
            ]);
        let envelope = self
            .api
            .send_enveloped::<String>(builder, "Failed to reset password")
            .await?;
        match envelope.status_code {
            Some(200) => Ok(envelope.data.unwrap_or_default()),
            status => Err(ApiError::Api {
                status: status.unwrap_or(400),
                message: envelope
                    .message
                    .unwrap_or_else(|| "Failed to reset password".to_string()),
            }),
        }
    }

    pub async fn verify_email(&self, token: &str) -> ApiResult<String> {
        let builder = self
            .api
            .request(Method::GET, &["auth", "verify-email"])?
            .query(&[("token", token)]);
        let envelope = self
            .api
            .send_enveloped::<serde_json::Value>(builder, "Failed to verify email. Please try again.")
            .await?;
        Ok(envelope
            .message
            .unwrap_or_else(|| "Email verified successfully!".to_string()))
    }

    /// Needs a logged-in session; the bearer token comes from it.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> ApiResult<()> {
        let session = self.current_session()?.ok_or(ApiError::NotAuthenticated)?;
        let body = ChangePasswordRequest {
            old_password: old_password.to_string(),
            new_password: new_password.to_string(),
            confirm_password: new_password.to_string(),
        };
        let builder = self
            .api
            .with_token(&session.token)
            .request(Method::PUT, &["users", "change-password"])?
            .query(&[("email", session.user.email.as_str())])
            .json(&body);
        self.api
            .send_empty(builder, "An error occurred while updating the password")
            .await
    }

    fn persist(&self, payload: AuthPayload) -> ApiResult<Session> {
        let session = Session::from(payload);
        if let Err(e) = self.store.save(&session) {
            warn!("[AUTH] Could not persist session: {}", e);
            return Err(e.into());
        }
        Ok(session)
    }
}

/// Replaces a server error code with readable text, keeping the status.
fn remap_server_message(error: ApiError, code: &str, readable: &str) -> ApiError {
    if error.server_message() != Some(code) {
        return error;
    }
    ApiError::Api {
        status: error.status().unwrap_or(400),
        message: readable.to_string(),
    }
}
