mod extractor;
mod rate_limit;

pub use extractor::*;
pub use rate_limit::*;
