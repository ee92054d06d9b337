pub mod alloc;
pub mod config;
pub mod error;
pub mod family;
pub mod fixture;
pub mod metrics;
pub mod repair;
pub mod rest;
pub mod service;
pub mod storage;
pub mod validation;
