pub mod token_bridge;

pub use token_bridge::TokenBridge;
