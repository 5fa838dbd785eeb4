pub mod approval;
pub mod cache;
pub mod canonical;
pub mod handlers;
pub mod layout;
pub mod models;
pub mod schema;
pub mod state;
pub mod validation;

#[cfg(test)]
pub(crate) mod fixtures;
