pub mod id;
pub mod sequence;

pub use sequence::SequenceGenerator;
