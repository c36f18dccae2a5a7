// Echo-based clock synchronization between the hub and its clients

use crate::hub::error::{HubError, Result};
use crate::hub::frame::{FrameReader, FrameWriter};
use crate::hub::letter::{preview, Payload, ECHO_PREFIX};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

/// Seconds since the UNIX epoch on this machine's clock
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One completed echo round trip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EchoSample {
    /// Hub clock when the probe was sent
    pub t1: f64,
    /// Client clock when the probe was answered
    pub t2: f64,
    /// Hub clock when the reply arrived
    pub t3: f64,
}

impl EchoSample {
    pub fn delay(&self) -> f64 {
        self.t3 - self.t1
    }
}

/// Per-client clock relation, derived once at connect time
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockState {
    pub net_delay: f64,
    /// Client clock at the reference instant
    pub net_remote_time: f64,
    /// Hub clock at the same instant
    pub net_local_time: f64,
}

impl ClockState {
    /// Relation for the hub's own clock
    pub fn local() -> Self {
        Self::default()
    }

    /// Client clock minus hub clock
    pub fn offset(&self) -> f64 {
        self.net_remote_time - self.net_local_time
    }

    /// Client time to hub time
    pub fn to_local(&self, t: f64) -> f64 {
        t - self.net_remote_time + self.net_local_time
    }

    /// Hub time to client time
    pub fn to_remote(&self, t: f64) -> f64 {
        t - self.net_local_time + self.net_remote_time
    }

    /// Pick the minimum-delay sample and derive the clock relation from it
    pub fn estimate(samples: &[EchoSample]) -> Option<Self> {
        let best = samples
            .iter()
            .filter(|s| s.delay().is_finite() && s.delay() >= 0.0)
            .min_by(|a, b| a.delay().total_cmp(&b.delay()))?;

        let delay = best.delay();
        Some(Self {
            net_delay: delay,
            net_local_time: (best.t1 + best.t3) / 2.0,
            net_remote_time: best.t2 + delay / 2.0,
        })
    }
}

/// Parameters of the echo exchange
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub probes: usize,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            probes: 20,
            interval: Duration::from_millis(10),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// Parse the fields of an `Echo,<t1>,<t2>` reply (prefix already stripped)
pub fn parse_echo_reply(fields: &str) -> Option<(f64, f64)> {
    let (t1, t2) = fields.split_once(',')?;
    Some((t1.trim().parse().ok()?, t2.trim().parse().ok()?))
}

/// Parse the field of an `Echo,<t1>` probe
pub fn parse_echo_probe(fields: &str) -> Option<f64> {
    let t1 = fields.split(',').next()?;
    t1.trim().parse().ok()
}

pub fn echo_probe(t1: f64) -> String {
    format!("{ECHO_PREFIX},{t1}")
}

pub fn echo_reply(t1: &str, t2: f64) -> String {
    format!("{ECHO_PREFIX},{},{t2}", t1.trim())
}

/// Run the broker side of the echo exchange over an authenticated stream.
///
/// Probes that time out or return a malformed reply are dropped from the
/// sample set. Fails with `SyncFailure` only when no probe succeeded.
pub async fn synchronize<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    settings: SyncSettings,
) -> Result<ClockState>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut samples = Vec::with_capacity(settings.probes);

    for probe in 0..settings.probes {
        let t1 = now_secs();
        writer.write_frame(echo_probe(t1).as_bytes()).await?;

        match await_echo(reader, t1, settings.probe_timeout).await? {
            Some(sample) => samples.push(sample),
            None => tracing::debug!("Echo probe {} produced no usable reply", probe),
        }

        tokio::time::sleep(settings.interval).await;
    }

    let clock = ClockState::estimate(&samples).ok_or(HubError::SyncFailure {
        probes: settings.probes,
    })?;

    tracing::debug!(
        "Clock sync used {}/{} samples, delay {:.6}s offset {:.6}s",
        samples.len(),
        settings.probes,
        clock.net_delay,
        clock.offset()
    );

    Ok(clock)
}

/// Wait for the reply to the probe sent at `t1`.
///
/// Frames that are not echoes, or echo a different probe, are skipped.
async fn await_echo<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    t1: f64,
    timeout: Duration,
) -> Result<Option<EchoSample>> {
    let deadline = Instant::now() + timeout;

    loop {
        let frame = match tokio::time::timeout_at(deadline, reader.read_next()).await {
            Err(_) => return Ok(None),
            Ok(frame) => frame?,
        };
        let t3 = now_secs();

        let Some(body) = frame else {
            return Err(HubError::Closed);
        };
        let Ok(text) = String::from_utf8(body) else {
            continue;
        };

        match Payload::classify(&text, &[]) {
            Payload::Echo(fields) => match parse_echo_reply(fields) {
                Some((echoed, t2)) if echoed == t1 => {
                    return Ok(Some(EchoSample { t1, t2, t3 }));
                }
                Some(_) => tracing::debug!("Skipping stale echo reply"),
                None => {
                    tracing::debug!("Malformed echo reply: {}", preview(&text));
                    return Ok(None);
                }
            },
            _ => tracing::debug!("Ignoring frame during clock sync: {}", preview(&text)),
        }
    }
}
