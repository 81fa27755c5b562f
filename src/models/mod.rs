mod paper;

pub use paper::*;
