pub mod config;
pub mod template;
pub mod text;
pub mod trace;
