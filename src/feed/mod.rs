mod fetcher;

pub use fetcher::ArxivFetcher;
