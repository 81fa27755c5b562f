mod embedder;

pub use embedder::{Embedder, HttpEmbedder};
