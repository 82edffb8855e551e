pub mod questdb;
pub mod questdb_ilp;

pub use questdb::QuestDbWatermarkStore;
pub use questdb_ilp::QuestDbIlpSink;
