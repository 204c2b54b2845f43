pub mod billing_event;
pub mod credit;
pub mod payment;
pub mod payment_status;
pub mod plan;
pub mod shop;
pub mod subscription;
pub mod subscription_status;
pub mod usage;
pub mod webhook;
