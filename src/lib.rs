pub mod app;
pub mod blob;
pub mod config;
pub mod error;
pub mod identity;
pub mod pages;
pub mod session;
pub mod store;
pub mod sync;
pub mod utils;

pub mod schema {
    pub mod api;
    pub mod db;
    pub mod query;
}
