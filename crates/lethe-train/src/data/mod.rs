pub mod batch;
pub mod dataset;
pub mod loader;

pub use batch::{Batch, MemoryRows};
pub use dataset::{
    JsonlRetrievalDataset, RetrievalDataset, RetrievalExample, SyntheticRetrievalDataset,
};
pub use loader::RetrievalLoader;
