//! Shard routing: mapping (database, policy, series, timestamp) onto
//! shards and their replica owners.

mod router;

pub use router::{RoutedShard, ShardRouter};
