pub mod builder;
pub mod config;
pub mod export;
pub mod import;
pub mod menus;
pub mod phpser;
pub mod plugins;
pub mod rewrite;
pub mod runtime;
pub mod store;
