//! Background guide-scan driver: walks every known mux on an interval,
//! captures just enough of each to decode its PSIP tables, and stores the
//! resulting channel/program data in the EPG store. Timing and the capture
//! invocation shape are grounded on `original_source/src/epg.c:
//! epg_worker/scan_mux`; table dispatch is new, tying together
//! `crate::demux`'s packet/section/psip layers that the original decoded
//! inline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channels::ChannelCatalog;
use crate::demux::psip::{parse_eit, parse_vct, EIT_TABLE_ID_RANGE, VCT_TABLE_IDS};
use crate::demux::section::Demuxer;
use crate::epg::EpgStore;
use crate::process::{spawn, terminate, StdioKind};
use crate::tuner::{TunerPool, UserClass};

/// PID carrying ATSC PSIP tables (VCT, EIT, ETT, ...).
const PSIP_PID: u16 = 0x1FFB;

/// Wait this long after startup before the first scan cycle, so the server
/// finishes binding its listener before burning a tuner on background work.
const STARTUP_DELAY: Duration = Duration::from_secs(5);

/// How long to let a mux's capture run before moving to the next one.
const CAPTURE_SECONDS: u32 = 15;

/// Retry a busy tuner this many times before giving up on a mux for this
/// cycle.
const ACQUIRE_RETRIES: u32 = 5;
const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between muxes within one cycle, so a burst of captures doesn't
/// monopolize every tuner at once.
const INTER_MUX_DELAY: Duration = Duration::from_secs(2);

/// Pause between full scan cycles.
const INTER_CYCLE_DELAY: Duration = Duration::from_secs(15 * 60);

const READ_CHUNK: usize = 64 * 1024;

/// Drives periodic background scans of every mux in the channel catalog,
/// decoding VCT/EIT tables into the EPG store.
pub struct ScanDriver {
    pool: Arc<TunerPool>,
    store: EpgStore,
    catalog: Arc<ChannelCatalog>,
    channels_conf_path: PathBuf,
    capture_program: String,
}

impl ScanDriver {
    pub fn new(
        pool: Arc<TunerPool>,
        store: EpgStore,
        catalog: Arc<ChannelCatalog>,
        channels_conf_path: PathBuf,
        capture_program: String,
    ) -> Self {
        Self {
            pool,
            store,
            catalog,
            channels_conf_path,
            capture_program,
        }
    }

    /// Run forever until `shutdown` is signalled: an initial delay, then
    /// alternating scan cycles and cooldowns.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if sleep_cancelable(STARTUP_DELAY, &mut shutdown).await.is_err() {
            return;
        }

        loop {
            self.run_cycle(&mut shutdown).await;
            if sleep_in_slices(INTER_CYCLE_DELAY, &mut shutdown).await.is_err() {
                return;
            }
        }
    }

    /// Walk every unique frequency in the catalog once, scanning each mux
    /// in turn. A fresh source-id map is kept per cycle since VCT entries
    /// can be reassigned between cycles (mux re-plans, provider changes).
    async fn run_cycle(&self, shutdown: &mut watch::Receiver<bool>) {
        let frequencies = self.catalog.unique_frequencies();
        info!(muxes = frequencies.len(), "starting guide scan cycle");

        let mut source_ids: HashMap<(String, u16), String> = HashMap::new();

        for frequency in frequencies {
            if *shutdown.borrow() {
                return;
            }

            let Some(channel) = self.catalog.first_on_frequency(frequency) else {
                continue;
            };

            match self.scan_mux(frequency, &channel.number, &mut source_ids).await {
                Ok(events) => debug!(frequency, events, "scanned mux"),
                Err(e) => warn!(frequency, error = %e, "mux scan failed"),
            }

            if sleep_cancelable(INTER_MUX_DELAY, shutdown).await.is_err() {
                return;
            }
        }
    }

    /// Acquire an EPG-class tuner lease (retrying while streaming traffic
    /// holds every tuner), capture `CAPTURE_SECONDS` of `channel_number`'s
    /// mux, and decode any PSIP sections seen. Returns the number of
    /// program entries stored.
    async fn scan_mux(
        &self,
        frequency: &str,
        channel_number: &str,
        source_ids: &mut HashMap<(String, u16), String>,
    ) -> anyhow::Result<usize> {
        let lease = self.acquire_with_retries().await?;
        let adapter_id = lease.tuner_id().0;

        let args = vec![
            "-c".to_string(),
            self.channels_conf_path.to_string_lossy().to_string(),
            "-a".to_string(),
            adapter_id.to_string(),
            "-P".to_string(),
            "-t".to_string(),
            CAPTURE_SECONDS.to_string(),
            "-o".to_string(),
            "-".to_string(),
            channel_number.to_string(),
        ];

        let mut capture = spawn(
            "epg-scan",
            &self.capture_program,
            &args,
            StdioKind::Null,
            StdioKind::Pipe,
            StdioKind::Null,
        )?;
        let mut stdout = capture.stdout().expect("capture stdout piped");

        let mut demux = Demuxer::new(vec![PSIP_PID]);
        let mut stored = 0usize;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            if !self.pool.is_still_held_by(lease.tuner_id(), lease.owner_token()).await {
                info!(frequency, "tuner preempted by streaming request, aborting scan");
                break;
            }

            let n = match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(frequency, error = %e, "capture read failed during scan");
                    break;
                }
            };

            let store = &self.store;
            let mut pending: Vec<(u8, Vec<u8>)> = Vec::new();
            demux.process_chunk(&buf[..n], |_pid, section| {
                pending.push((section[0], section.to_vec()));
            });

            for (table_id, section) in pending {
                stored += dispatch_section(store, frequency, channel_number, source_ids, table_id, &section).await?;
            }
        }

        terminate(&mut capture, Duration::from_secs(2)).await;
        lease.release_and_wait().await;
        Ok(stored)
    }

    async fn acquire_with_retries(&self) -> anyhow::Result<crate::tuner::TunerLease> {
        for attempt in 0..ACQUIRE_RETRIES {
            match self.pool.acquire(UserClass::Epg).await {
                Ok(lease) => return Ok(lease),
                Err(_) if attempt + 1 < ACQUIRE_RETRIES => {
                    tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("loop always returns on its last iteration")
    }
}

/// Decode one completed PSIP section and store whatever it yields. VCT
/// sections update the frequency's source-id map (virtual channel number ->
/// ATSC source_id); EIT sections look up that map to attribute events to a
/// channel number. Sections for other table ids (ETT, etc.) are ignored —
/// extended text isn't part of the guide surface this store exposes.
async fn dispatch_section(
    store: &EpgStore,
    frequency: &str,
    channel_number: &str,
    source_ids: &mut HashMap<(String, u16), String>,
    table_id: u8,
    section: &[u8],
) -> anyhow::Result<usize> {
    if VCT_TABLE_IDS.contains(&table_id) {
        for entry in parse_vct(section) {
            let number = format!("{}.{}", entry.major, entry.minor);
            source_ids.insert((frequency.to_string(), entry.source_id), number);
        }
        return Ok(0);
    }

    if EIT_TABLE_ID_RANGE.contains(&table_id) {
        let mut stored = 0usize;
        for event in parse_eit(section) {
            let number = source_ids
                .get(&(frequency.to_string(), event.source_id))
                .cloned()
                .unwrap_or_else(|| channel_number.to_string());

            store
                .upsert_program(
                    frequency,
                    &number,
                    event.source_id,
                    event.event_id,
                    event.start_unix_ms,
                    event.end_unix_ms,
                    &event.title,
                )
                .await?;
            stored += 1;
        }
        return Ok(stored);
    }

    Ok(0)
}

/// Sleep for `duration`, waking early (and returning `Err(())`) if shutdown
/// fires first.
async fn sleep_cancelable(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<(), ()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        result = shutdown.changed() => {
            match result {
                Ok(()) if *shutdown.borrow() => Err(()),
                _ => Ok(()),
            }
        }
    }
}

/// Sleep for a long `duration` in 1-second slices so shutdown is noticed
/// promptly even mid-wait, mirroring the original scan loop's 1s-sliced
/// inter-cycle sleep.
async fn sleep_in_slices(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<(), ()> {
    let slice = Duration::from_secs(1);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if *shutdown.borrow() {
            return Err(());
        }
        let step = slice.min(remaining);
        sleep_cancelable(step, shutdown).await?;
        remaining = remaining.saturating_sub(step);
    }
    Ok(())
}
