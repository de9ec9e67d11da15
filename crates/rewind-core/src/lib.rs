//! Reactive resource-lifetime runtime.
//!
//! Realms publish values whose lifetimes are owned by the observation that
//! received them; blueprints turn straight-line functions with
//! [`use_realm`] suspension points into realms by replay; cells, stores,
//! and portals are the mutable containers on top.
//!
//! The runtime is single-threaded and cooperative: run it inside a
//! [`tokio::task::LocalSet`] on a current-thread runtime. Release futures
//! are the only asynchronous surface.

pub mod blueprint;
pub mod cell;
pub mod context;
pub mod effect;
pub mod error;
pub mod hooks;
mod links;
pub mod portal;
pub mod prelude;
pub mod realm;
pub mod resource;
pub mod store;
pub mod tests;

pub use blueprint::*;
pub use cell::*;
pub use context::*;
pub use effect::*;
pub use error::*;
pub use hooks::*;
pub use portal::*;
pub use realm::*;
pub use resource::*;
pub use store::*;
