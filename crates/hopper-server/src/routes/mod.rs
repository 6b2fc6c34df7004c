pub mod events;
pub mod health;
pub mod inbox;
pub mod metrics;
pub mod registrations;
pub mod users;
