pub mod aggregator;
pub mod reporter;

pub use aggregator::StatsAggregator;
pub use reporter::StatsReporter;
