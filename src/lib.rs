pub mod audio;
pub mod bitrate;
pub mod config;
pub mod controller;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod logging;
pub mod media;
pub mod settings;
pub mod tracker;
pub mod workspace;
