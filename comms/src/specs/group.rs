use serde::{Deserialize, Serialize};

/// Wire-level handshake a peer sends to the root when joining a process group.
///
/// The root checks that `world_size` matches its own and that `rank` is in
/// range and not yet taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub rank: usize,
    pub world_size: usize,
}
