pub mod glu;

pub use crate::feedforward::glu::GluFeedForward;
