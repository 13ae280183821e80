pub mod finish;
pub mod grammar;
pub mod parser;
pub mod types;

pub use finish::{FinishDetector, FinishEvidence, FinishSignal};
pub use parser::{parse, ParsedResponse, ResponseForm};
pub use types::{Action, ParsedAction, Point};
