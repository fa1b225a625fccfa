pub mod captcha;
pub mod client;
pub mod config;
pub mod crypto;
pub mod harvest;
pub mod orchestrator;
pub mod outcome;
