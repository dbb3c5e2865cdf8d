pub mod access;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod history;
pub mod ledger;
pub mod models;
pub mod routes;
pub mod s3;
pub mod schema;
pub mod sponsorship;
pub mod state;
pub mod storage;
pub mod utils;
