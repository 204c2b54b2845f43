pub mod billing_provider;
pub mod cache;
pub mod notifier;
