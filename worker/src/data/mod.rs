pub mod augment;
pub mod dataloader;
pub mod dataset;
pub mod sampler;
pub mod shard;
pub mod synthetic;

pub use augment::Augmenter;
pub use dataloader::{Batches, DataLoader};
pub use dataset::{Batch, InMemoryDataset, Sample};
pub use sampler::DistributedSampler;
pub use shard::shard_range;
pub use synthetic::PhantomGenerator;
