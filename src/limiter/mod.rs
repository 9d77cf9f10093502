pub mod distributed;
pub mod local;

pub use distributed::{
    bucket_key, idempotency_key, ConsumeRequest, DistributedBucketStore, DistributedDecision,
    InMemoryBucketStore,
};
pub use local::{LocalBucketEngine, LocalBucketState};
