// Core models
pub mod cache_entry;
pub mod events;
pub mod fee_schedule;
pub mod leaderboard;
pub mod match_entity;
pub mod quantity;
pub mod requests;
pub mod wallet_status;

// Re-export commonly used types
pub use cache_entry::*;
pub use events::*;
pub use fee_schedule::*;
pub use leaderboard::*;
pub use match_entity::*;
pub use quantity::*;
pub use requests::*;
pub use wallet_status::*;
