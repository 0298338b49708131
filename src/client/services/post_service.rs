use std::collections::{BTreeSet, HashMap};

use futures_util::future::join_all;
use log::warn;
use reqwest::Method;

use crate::client::services::http::{ApiClient, ApiError, ApiResult};
use crate::common::models::{Post, UserProfile};

const ANONYMOUS: &str = "Anonymous";

#[derive(Debug, Clone)]
pub struct PostService {
    api: ApiClient,
}

impl PostService {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Timeline of every post, each tagged with its owner's name and picture.
    pub async fn fetch_posts(&self) -> ApiResult<Vec<Post>> {
        let builder = self.api.request(Method::GET, &["items", "all-posts"])?;
        let posts = self.fetch_list(builder, "Error fetching posts").await?;
        Ok(self.with_authors(posts).await)
    }

    /// Posts owned by `email`. A user with no posts yields an empty list.
    pub async fn fetch_posts_by_email(&self, email: &str) -> ApiResult<Vec<Post>> {
        let builder = self
            .api
            .request(Method::GET, &["items", "user-posts"])?
            .query(&[("email", email)]);
        let posts = self
            .fetch_list(builder, "Error fetching posts by email")
            .await?;
        Ok(self.with_authors(posts).await)
    }

    pub async fn get_item(&self, id: i64) -> ApiResult<Post> {
        self.api
            .get(&["items", &id.to_string()], "Error fetching item by ID")
            .await
    }

    pub async fn create_post(&self, post: &Post) -> ApiResult<()> {
        let builder = self
            .api
            .request(Method::POST, &["items", "create"])?
            .json(post);
        self.api.send_empty(builder, "Error creating post").await
    }

    pub async fn update_post(&self, id: i64, post: &Post) -> ApiResult<()> {
        let builder = self
            .api
            .request(Method::PUT, &["items", &id.to_string()])?
            .json(post);
        self.api.send_empty(builder, "Failed to update post").await
    }

    pub async fn delete_post(&self, id: i64) -> ApiResult<()> {
        if self.api.token().is_none() {
            return Err(ApiError::NotAuthenticated);
        }
        let builder = self
            .api
            .request(Method::DELETE, &["items", &id.to_string()])?;
        self.api.send_empty(builder, "Error deleting post").await
    }

    pub async fn fetch_categories(&self) -> ApiResult<Vec<String>> {
        let builder = self.api.request(Method::GET, &["items", "categories"])?;
        self.fetch_list(builder, "Error fetching categories").await
    }

    pub async fn fetch_conditions(&self) -> ApiResult<Vec<String>> {
        let builder = self.api.request(Method::GET, &["items", "conditions"])?;
        self.fetch_list(builder, "Error fetching conditions").await
    }

    async fn fetch_list<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        default_error: &str,
    ) -> ApiResult<Vec<T>> {
        let envelope = self
            .api
            .send_enveloped::<Vec<T>>(builder, default_error)
            .await?;
        Ok(envelope.data.unwrap_or_default())
    }

    /// One profile lookup per distinct owner; failed lookups fall back to
    /// "Anonymous" with no picture.
    async fn with_authors(&self, posts: Vec<Post>) -> Vec<Post> {
        if posts.is_empty() {
            return posts;
        }
        let emails: BTreeSet<String> = posts.iter().map(|p| p.email.clone()).collect();
        let lookups = emails.into_iter().map(|email| async move {
            let profile = self
                .api
                .get::<UserProfile>(&["users", &email], "Error fetching user profile")
                .await;
            if let Err(e) = &profile {
                warn!("[POSTS] Error fetching user data for {}: {}", email, e);
            }
            (email, profile.ok())
        });
        let authors: HashMap<String, Option<UserProfile>> = join_all(lookups).await.into_iter().collect();

        posts
            .into_iter()
            .map(|post| {
                let profile = authors.get(&post.email).cloned().flatten();
                attach_author(post, profile.as_ref())
            })
            .collect()
    }
}

fn attach_author(mut post: Post, profile: Option<&UserProfile>) -> Post {
    post.user_name = Some(
        profile
            .and_then(UserProfile::display_name)
            .unwrap_or_else(|| ANONYMOUS.to_string()),
    );
    post.user_image_url = Some(
        profile
            .and_then(|p| p.profile_image_url.clone())
            .unwrap_or_default(),
    );
    post
}
