pub mod auth_service;
pub mod chat_connection;
pub mod chat_service;
pub mod donation_service;
pub mod http;
pub mod message_parser;
pub mod post_service;
pub mod stomp;
pub mod upload_service;
pub mod users_service;
pub mod websocket_client;
