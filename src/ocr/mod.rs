pub mod consensus;
pub mod detail;
pub mod engine;
pub mod preprocess;
pub mod setup;

pub use consensus::{ConsensusConfig, ConsensusFieldDecoder, FieldDecoder};
pub use detail::{DetailConfig, DetailReader, DetailViewReader};
pub use engine::{Tesseract, TextRecognizer};
pub use setup::find_tesseract;
