// Core services
pub mod cart;
pub mod orders;
pub mod stock;

// Collaborators of the order lifecycle
pub mod notifications;
pub mod payments;

// Service factory for dependency injection
pub mod factory;
