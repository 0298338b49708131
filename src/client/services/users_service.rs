use reqwest::Method;

use crate::client::services::http::{ApiClient, ApiResult};
use crate::common::models::{ProfileUpdate, UserProfile};

#[derive(Debug, Clone)]
pub struct UsersService {
    api: ApiClient,
}

impl UsersService {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    pub async fn get_profile(&self, email: &str) -> ApiResult<UserProfile> {
        self.api
            .get(&["users", email], "Error fetching user profile")
            .await
    }

    pub async fn update_profile(&self, email: &str, update: &ProfileUpdate) -> ApiResult<UserProfile> {
        let builder = self
            .api
            .request(Method::PUT, &["users", "update"])?
            .query(&[("email", email)])
            .json(update);
        self.api
            .send_data(builder, "Error updating user profile")
            .await
    }

    /// All registered users; a `null` payload is an empty list.
    pub async fn list_all(&self) -> ApiResult<Vec<UserProfile>> {
        let builder = self.api.request(Method::GET, &["users", ""])?;
        let envelope = self
            .api
            .send_enveloped::<Vec<UserProfile>>(builder, "Error listing users")
            .await?;
        Ok(envelope.data.unwrap_or_default())
    }
}
