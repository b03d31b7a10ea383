pub mod backend;
pub mod engine;
pub mod hooks;
pub mod node;
pub mod owner;
pub mod translator;
