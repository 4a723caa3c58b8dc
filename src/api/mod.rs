pub mod admin;
pub mod consumer;
pub mod rest;
