pub mod auth_service;
pub mod background_sync;
pub mod network_service;
