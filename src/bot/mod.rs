//! Chat bot behaviour layered on the pipeline: routing and persona.

pub mod persona;
pub mod router;

pub use persona::Persona;
pub use router::{BotIdentity, ChatRouter, PraisePolicy, Routed};
