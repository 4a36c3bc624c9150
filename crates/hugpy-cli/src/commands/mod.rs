pub mod config;
pub mod download;
pub mod generate;
pub mod info;
pub mod models;
pub mod resolve;
