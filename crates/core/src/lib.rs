pub mod types;
pub mod error;
pub mod step;
pub mod context;
pub mod cache;
pub mod matcher;
pub mod ocr;
pub mod resolve;
pub mod interpreter;
pub mod dispatch;
pub mod validate;
pub mod stats;
pub mod runner;
pub mod settings;
pub mod logger;
pub mod sleep;
pub mod platform;
