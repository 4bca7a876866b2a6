//! Tuner pool: discovers physical DVB adapters, grants exclusive leases to
//! callers, and arbitrates contention between the guide scanner and live
//! streaming clients.

mod pool;

pub use pool::{TunerLease, TunerPool};

use std::path::PathBuf;

/// Who is asking for a tuner. `Stream` always wins contention against an
/// `Epg` holder; `Epg` never preempts anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserClass {
    Stream,
    Epg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TunerId(pub u32);

impl std::fmt::Display for TunerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct TunerDescriptor {
    pub id: TunerId,
    pub device_path: PathBuf,
}

/// `capture_pid`/`encode_pid` are recorded by the lease holder once its
/// children are spawned (spec §4.C step 5), so a preempting `acquire` can
/// terminate them under the pool lock instead of waiting for the preempted
/// holder to notice on its own.
#[derive(Debug, Clone)]
struct Holder {
    user_class: UserClass,
    owner_token: u64,
    capture_pid: Option<u32>,
    encode_pid: Option<u32>,
}
