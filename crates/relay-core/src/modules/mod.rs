pub mod poller;
pub mod webhooks;
