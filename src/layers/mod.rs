/// Neural network layer primitives
///
/// - GRU recurrence for the sequence encoder
/// - Dense layer with optional sigmoid for the proposal head

pub mod dense;
pub mod gru;

pub use dense::{Activation, Dense};
pub use gru::GruLayer;
