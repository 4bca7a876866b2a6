use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::process::{terminate, ChildHandle};

use super::{Holder, TunerDescriptor, TunerId, UserClass};

struct Slot {
    descriptor: TunerDescriptor,
    held: Option<Holder>,
}

struct Inner {
    slots: Vec<Slot>,
    last_leased_index: usize,
}

/// Shared pool of tuner adapters. A single `tokio::sync::Mutex` linearizes
/// every acquire/release/preempt decision, matching the single pool-lock
/// design the round-robin-plus-preemption algorithm requires: scanning for
/// a free slot and granting it must be one atomic step, or two concurrent
/// acquirers could both claim the same tuner.
pub struct TunerPool {
    inner: Mutex<Inner>,
    next_owner_token: AtomicU64,
}

impl TunerPool {
    pub fn new(descriptors: Vec<TunerDescriptor>) -> Arc<Self> {
        let slots = descriptors
            .into_iter()
            .map(|descriptor| Slot {
                descriptor,
                held: None,
            })
            .collect();

        Arc::new(Self {
            inner: Mutex::new(Inner {
                slots,
                last_leased_index: 0,
            }),
            next_owner_token: AtomicU64::new(1),
        })
    }

    /// Walk `device_root` (default `/dev/dvb`) for `adapterN` entries.
    /// Non-numeric or malformed suffixes are skipped rather than treated as
    /// an error, since the directory may legitimately contain other files.
    pub fn discover(device_root: &Path) -> std::io::Result<Vec<TunerDescriptor>> {
        let mut found = Vec::new();
        let entries = match std::fs::read_dir(device_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(suffix) = name.strip_prefix("adapter") else {
                continue;
            };
            let Ok(id) = suffix.parse::<u32>() else {
                continue;
            };
            found.push(TunerDescriptor {
                id: TunerId(id),
                device_path: entry.path(),
            });
        }

        found.sort_by_key(|d| d.id);
        Ok(found)
    }

    /// Acquire a tuner for `user_class`. Tries a free slot first, scanning
    /// round-robin from just after the last slot handed out. If none is
    /// free and `user_class` is `Stream`, preempts the first `Epg`-held slot
    /// found (streaming always wins over background scanning; the reverse
    /// never happens). Returns `CoreError::NoTuner` if nothing is available.
    pub async fn acquire(self: &Arc<Self>, user_class: UserClass) -> CoreResult<TunerLease> {
        let mut inner = self.inner.lock().await;
        let n = inner.slots.len();
        if n == 0 {
            return Err(CoreError::NoTuner);
        }

        for offset in 1..=n {
            let idx = (inner.last_leased_index + offset) % n;
            if inner.slots[idx].held.is_none() {
                let token = self.next_owner_token.fetch_add(1, Ordering::Relaxed);
                let id = inner.slots[idx].descriptor.id;
                inner.slots[idx].held = Some(Holder {
                    user_class,
                    owner_token: token,
                    capture_pid: None,
                    encode_pid: None,
                });
                inner.last_leased_index = idx;
                info!(tuner = %id, ?user_class, "acquired free tuner");
                return Ok(TunerLease {
                    pool: Some(self.clone()),
                    tuner_id: id,
                    owner_token: token,
                });
            }
        }

        if user_class == UserClass::Stream {
            for slot in inner.slots.iter_mut() {
                if let Some(Holder {
                    user_class: UserClass::Epg,
                    capture_pid,
                    encode_pid,
                    ..
                }) = slot.held
                {
                    let token = self.next_owner_token.fetch_add(1, Ordering::Relaxed);
                    let id = slot.descriptor.id;
                    info!(tuner = %id, ?capture_pid, ?encode_pid, "preempting EPG scan for streaming request");

                    // Terminate the preempted holder's recorded children
                    // synchronously (spec §4.B step 2): a bare SIGTERM is a
                    // non-blocking syscall, so this stays inside the
                    // lock-held critical section without suspending. Actual
                    // reaping happens when the scan task's own ChildHandle
                    // next polls or waits on the now-dead pid.
                    for pid in [capture_pid, encode_pid].into_iter().flatten() {
                        unsafe {
                            libc::kill(pid as i32, libc::SIGTERM);
                        }
                    }

                    slot.held = Some(Holder {
                        user_class,
                        owner_token: token,
                        capture_pid: None,
                        encode_pid: None,
                    });
                    return Ok(TunerLease {
                        pool: Some(self.clone()),
                        tuner_id: id,
                        owner_token: token,
                    });
                }
            }
        }

        Err(CoreError::NoTuner)
    }

    async fn release(&self, tuner_id: TunerId, owner_token: u64) {
        let mut inner = self.inner.lock().await;
        for slot in inner.slots.iter_mut() {
            if slot.descriptor.id == tuner_id {
                match &slot.held {
                    Some(h) if h.owner_token == owner_token => {
                        slot.held = None;
                        info!(tuner = %tuner_id, "released tuner");
                    }
                    Some(h) => {
                        warn!(
                            tuner = %tuner_id,
                            held_token = h.owner_token,
                            release_token = owner_token,
                            "release() called with stale owner token, ignoring"
                        );
                    }
                    None => {}
                }
                return;
            }
        }
    }

    /// Per-tuner occupancy snapshot for metrics reporting: `(tuner_id,
    /// holder's user_class or None if free)`.
    pub async fn snapshot(&self) -> Vec<(TunerId, Option<UserClass>)> {
        let inner = self.inner.lock().await;
        inner
            .slots
            .iter()
            .map(|s| (s.descriptor.id, s.held.as_ref().map(|h| h.user_class)))
            .collect()
    }

    /// Record the pids of the children spawned under a lease, so a later
    /// preempting `acquire` can terminate them (spec §4.C step 5). A mismatched
    /// `owner_token` (the lease was itself already preempted) is a no-op.
    async fn record_children(&self, tuner_id: TunerId, owner_token: u64, capture_pid: Option<u32>, encode_pid: Option<u32>) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.descriptor.id == tuner_id) {
            if let Some(holder) = slot.held.as_mut() {
                if holder.owner_token == owner_token {
                    holder.capture_pid = capture_pid;
                    holder.encode_pid = encode_pid;
                }
            }
        }
    }

    /// True if the holder of `tuner_id` was preempted out from under the
    /// caller's lease: owner_token no longer matches. Used by the pipeline
    /// runner to detect that its children should be torn down because a
    /// higher-priority user took the tuner over.
    pub async fn is_still_held_by(&self, tuner_id: TunerId, owner_token: u64) -> bool {
        let inner = self.inner.lock().await;
        inner
            .slots
            .iter()
            .find(|s| s.descriptor.id == tuner_id)
            .and_then(|s| s.held.as_ref())
            .map(|h| h.owner_token == owner_token)
            .unwrap_or(false)
    }
}

/// An exclusive hold on one tuner. Dropping it without calling
/// `release_and_wait` spawns a detached release so the slot is never leaked,
/// but `release_and_wait` should be preferred wherever the caller can await.
pub struct TunerLease {
    pool: Option<Arc<TunerPool>>,
    tuner_id: TunerId,
    owner_token: u64,
}

impl TunerLease {
    pub fn tuner_id(&self) -> TunerId {
        self.tuner_id
    }

    pub fn owner_token(&self) -> u64 {
        self.owner_token
    }

    pub async fn release_and_wait(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(self.tuner_id, self.owner_token).await;
        }
    }

    /// Record this lease's child pids on the pool so a preempting `acquire`
    /// can terminate them directly (spec §4.C step 5).
    pub async fn record_children(&self, capture_pid: Option<u32>, encode_pid: Option<u32>) {
        if let Some(pool) = &self.pool {
            pool.record_children(self.tuner_id, self.owner_token, capture_pid, encode_pid).await;
        }
    }

    pub async fn terminate_and_release(mut self, mut children: Vec<ChildHandle>, grace: std::time::Duration) {
        for child in children.iter_mut() {
            terminate(child, grace).await;
        }
        if let Some(pool) = self.pool.take() {
            pool.release(self.tuner_id, self.owner_token).await;
        }
    }
}

impl Drop for TunerLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let tuner_id = self.tuner_id;
            let owner_token = self.owner_token;
            tokio::spawn(async move {
                pool.release(tuner_id, owner_token).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptors(n: u32) -> Vec<TunerDescriptor> {
        (0..n)
            .map(|i| TunerDescriptor {
                id: TunerId(i),
                device_path: PathBuf::from(format!("/dev/dvb/adapter{i}")),
            })
            .collect()
    }

    #[tokio::test]
    async fn acquire_is_mutually_exclusive() {
        let pool = TunerPool::new(descriptors(1));
        let lease = pool.acquire(UserClass::Stream).await.unwrap();
        let second = pool.acquire(UserClass::Epg).await;
        assert!(matches!(second, Err(CoreError::NoTuner)));
        lease.release_and_wait().await;
        assert!(pool.acquire(UserClass::Epg).await.is_ok());
    }

    #[tokio::test]
    async fn stream_preempts_epg_but_not_vice_versa() {
        let pool = TunerPool::new(descriptors(1));
        let epg_lease = pool.acquire(UserClass::Epg).await.unwrap();
        let stream_lease = pool.acquire(UserClass::Stream).await.unwrap();
        assert_eq!(stream_lease.tuner_id(), epg_lease.tuner_id());

        // The EPG lease's token is now stale; releasing it must not disturb
        // the stream holder's lease.
        epg_lease.release_and_wait().await;
        assert!(pool.is_still_held_by(stream_lease.tuner_id(), stream_lease.owner_token).await);

        stream_lease.release_and_wait().await;
        let epg_retry = pool.acquire(UserClass::Epg).await;
        assert!(epg_retry.is_ok());
    }

    #[tokio::test]
    async fn round_robin_spreads_across_slots() {
        let pool = TunerPool::new(descriptors(2));
        let a = pool.acquire(UserClass::Stream).await.unwrap();
        let b = pool.acquire(UserClass::Stream).await.unwrap();
        assert_ne!(a.tuner_id(), b.tuner_id());
    }

    #[tokio::test]
    async fn preemption_terminates_recorded_children() {
        let pool = TunerPool::new(descriptors(1));
        let epg_lease = pool.acquire(UserClass::Epg).await.unwrap();

        let mut sleeper = crate::process::spawn(
            "test-sleep",
            "sleep",
            &["5".to_string()],
            crate::process::StdioKind::Null,
            crate::process::StdioKind::Null,
            crate::process::StdioKind::Null,
        )
        .unwrap();
        let pid = sleeper.pid.unwrap();
        epg_lease.record_children(Some(pid), None).await;

        let _stream_lease = pool.acquire(UserClass::Stream).await.unwrap();

        // The preemption branch sent SIGTERM synchronously under the lock;
        // give the kernel a moment to deliver it and the child to exit.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let status = sleeper.wait().await.unwrap();
        assert!(!status.success());
    }
}
