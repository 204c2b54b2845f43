pub mod credits;
pub mod shop;
pub mod subscription;
pub mod usage;
pub mod webhook_handlers;
pub mod webhook_queue;
