mod scorer;

pub use scorer::{ClaudeScorer, PaperScorer};
