//! Prometheus metrics, following the teacher's `lazy_static` + `register_*`
//! pattern. The housekeeping loop and the `/metrics` handler both read
//! through these statics rather than threading a registry handle around.

use lazy_static::lazy_static;
use prometheus::{register_gauge, register_gauge_vec, Encoder, Gauge, GaugeVec, TextEncoder};

use crate::hls::HlsManager;
use crate::tuner::{TunerPool, UserClass};

lazy_static! {
    /// 1 if the tuner is held, 0 if free, labeled by tuner id and the
    /// holder's user class (`"stream"`/`"epg"`/`"free"`).
    pub static ref TUNER_HELD: GaugeVec = register_gauge_vec!(
        "zaplink_tuner_held",
        "Whether a tuner is currently held (1) or free (0)",
        &["tuner_id", "user_class"]
    )
    .unwrap();
    pub static ref HLS_ACTIVE_SESSIONS: Gauge = register_gauge!(
        "zaplink_hls_active_sessions",
        "Number of live HLS sessions"
    )
    .unwrap();
}

/// Refresh the tuner occupancy gauges from a fresh pool snapshot, then
/// render the full Prometheus text exposition.
pub async fn gather(pool: &TunerPool, hls: &HlsManager) -> String {
    for (tuner_id, holder) in pool.snapshot().await {
        let class_label = match holder {
            Some(UserClass::Stream) => "stream",
            Some(UserClass::Epg) => "epg",
            None => "free",
        };
        for label in ["stream", "epg", "free"] {
            TUNER_HELD
                .with_label_values(&[&tuner_id.to_string(), label])
                .set(if label == class_label { 1.0 } else { 0.0 });
        }
    }

    HLS_ACTIVE_SESSIONS.set(hls.session_count().await as f64);

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
