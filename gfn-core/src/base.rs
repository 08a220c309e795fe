//! Core functionalities.
mod action;
mod env;
mod id;
mod scorer;
mod space;
pub use action::{Action, SamplingMethod};
pub use env::Env;
pub use id::{TrajId, TrajIdPool};
pub use scorer::Scorer;
pub use space::StateSpace;
