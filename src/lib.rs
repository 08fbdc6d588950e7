pub mod api;
pub mod assemble;
pub mod auth;
pub mod config;
pub mod db;
pub mod enrich;
pub mod error;
pub mod parser;
pub mod pipeline;
pub mod scraper;
pub mod upsert;
