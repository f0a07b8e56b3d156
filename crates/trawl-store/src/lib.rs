pub mod csv_sink;
pub mod jsonl_store;

pub use csv_sink::CsvSink;
pub use jsonl_store::JsonlCacheStore;
