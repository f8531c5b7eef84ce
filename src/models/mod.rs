//! Data models for the save manager.
//!
//! Local records (`Game`, `Character`, `Save`) and the wire shapes exchanged with the server.

mod character;
mod game;
mod record;
mod save;
mod user;
mod wire;

pub use character::*;
pub use game::*;
pub use record::*;
pub use save::*;
pub use user::*;
pub use wire::*;
