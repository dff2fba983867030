pub mod document;
pub mod error;
pub mod pipeline;
pub mod query;
pub mod value;

pub use document::{Document, ID_FIELD};
pub use error::{Result, ShardError, ShardFailure};
pub use pipeline::{Accumulator, GroupKey, GroupStage, Operand, Stage, run_pipeline};
pub use query::{
    compare_documents, Condition, Filter, FindOptions, SortDirection, SortKey, UpdateSpec,
};
pub use value::Value;
