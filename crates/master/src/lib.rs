//! Master irrigation controller: exposes one logical set of zones backed by
//! zones on several physical controllers, and keeps at most one of them
//! running at a time.

pub mod catalog;
pub mod config;
pub mod db;
pub mod device;
pub mod driver;
pub mod error;
pub mod mqtt;
pub mod poller;
pub mod service;
pub mod state;
pub mod store;
pub mod web;

mod activation;
mod reconcile;
mod valve;

#[cfg(test)]
mod testing;
