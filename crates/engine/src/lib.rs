pub mod broker;
pub mod campaign;
pub mod campaign_store;
pub mod dedup;
pub mod email_log;
pub mod memory;
pub mod producer;
pub mod templates;
