pub mod cli;
pub mod commands;
pub mod compare;
pub mod config;
pub mod monitor;
pub mod output;
