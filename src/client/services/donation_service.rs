use reqwest::Method;

use crate::client::services::http::{ApiClient, ApiResult};
use crate::common::models::{DonateRequest, Donation};

/// Interest records linking a prospective recipient to a listed item.
/// Status changes are made server-side; this only requests and reads them.
#[derive(Debug, Clone)]
pub struct DonationService {
    api: ApiClient,
}

impl DonationService {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Registers `user_id`'s interest in an item.
    pub async fn create_donation(&self, item_post_id: i64, user_id: i64) -> ApiResult<Donation> {
        let request = DonateRequest { item_post_id, user_id };
        self.api
            .post_json(&["donations", ""], &request, "Failed to create donation")
            .await
    }

    /// Everyone who asked for the item, with the status of each request.
    pub async fn interested_users(&self, item_post_id: i64) -> ApiResult<Vec<Donation>> {
        self.list(
            &["donations", "item", &item_post_id.to_string()],
            "Failed to load interested users",
        )
        .await
    }

    /// The owner hands the item to `user_id`.
    pub async fn donate(&self, user_id: i64, item_post_id: i64) -> ApiResult<Donation> {
        let request = DonateRequest { item_post_id, user_id };
        self.api
            .post_json(&["donations", "donate"], &request, "Failed to donate")
            .await
    }

    pub async fn donations_by_user(&self, user_id: i64) -> ApiResult<Vec<Donation>> {
        self.list(
            &["donations", "user", &user_id.to_string()],
            "Failed to load donations",
        )
        .await
    }

    pub async fn get_donation(&self, id: i64) -> ApiResult<Donation> {
        self.api
            .get(&["donations", &id.to_string()], "Failed to load donation")
            .await
    }

    async fn list(&self, segments: &[&str], default_error: &str) -> ApiResult<Vec<Donation>> {
        let builder = self.api.request(Method::GET, segments)?;
        let envelope = self
            .api
            .send_enveloped::<Vec<Donation>>(builder, default_error)
            .await?;
        Ok(envelope.data.unwrap_or_default())
    }
}
