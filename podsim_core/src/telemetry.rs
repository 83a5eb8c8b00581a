//! Pod telemetry loading and replay.
//!
//! Each pod's status reports live in their own JSON Lines file, one
//! `DeliveryEvent` per line, named after the pod id. Files are read under a
//! shared lock and appended under an exclusive one.

use crate::series::epoch_seconds;
use crate::session::{PodSession, PodSettings, Reading, SessionEvent};
use crate::types::{CommandKind, DeliveryEvent};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Pulse interval assumed when a bolus command carries none, seconds
const DEFAULT_BOLUS_INTERVAL: f64 = 2.0;

fn reading_of(report: &DeliveryEvent) -> Reading {
    Reading {
        at: epoch_seconds(report.timestamp),
        minute: report.active_minute,
        delivered: report.delivered_units,
        undelivered: report.canceled_units,
        reservoir: report.reservoir_units,
    }
}

/// Interpret one status report
///
/// Faults win over the command. Reports for failed commands carry no
/// transition and decode to `None`; other successful commands are heartbeats.
pub fn decode(report: &DeliveryEvent) -> Result<Option<SessionEvent>> {
    let reading = reading_of(report);
    let command = &report.last_command;
    let parameters = &command.parameters;

    if report.fault {
        return Ok(Some(SessionEvent::Fail {
            reading,
            failed_minute: report.fault_minute.unwrap_or(report.active_minute),
        }));
    }
    if !command.success {
        return Ok(None);
    }

    let event = match command.kind {
        CommandKind::Start => {
            let basal_rate = parameters.hourly_rates.first().copied().ok_or_else(|| {
                Error::Telemetry(format!(
                    "START at {} has no basal schedule",
                    report.timestamp
                ))
            })?;
            // without an activation date, the pod clock baseline is the best anchor
            let activation = report
                .activation_date
                .map(epoch_seconds)
                .unwrap_or(reading.at - reading.minute as f64 * 60.0);
            SessionEvent::Start {
                reading,
                basal_rate,
                activation,
            }
        }
        CommandKind::TempBasal => {
            let (Some(rate), Some(hours)) = (parameters.hourly_rate, parameters.duration_hours)
            else {
                return Err(Error::Telemetry(format!(
                    "TEMPBASAL at {} without rate or duration",
                    report.timestamp
                )));
            };
            SessionEvent::TempBasalStart {
                reading,
                rate,
                minutes: (hours * 60.0).round() as u32,
            }
        }
        CommandKind::TempBasalCancel => SessionEvent::TempBasalEnd { reading },
        CommandKind::Bolus => SessionEvent::BolusStart {
            reading,
            interval: Some(parameters.interval.unwrap_or(DEFAULT_BOLUS_INTERVAL)),
        },
        CommandKind::BolusCancel => SessionEvent::BolusEnd { reading },
        CommandKind::Deactivate => SessionEvent::Deactivate { reading },
        CommandKind::Status => SessionEvent::Entry { reading },
    };
    Ok(Some(event))
}

/// Replay a pod's reports into a session, stopping once it has ended
///
/// Reports that cannot be decoded are skipped with a warning.
pub fn replay_events(
    reports: &[DeliveryEvent],
    pod_id: &str,
    settings: PodSettings,
) -> PodSession {
    let mut session = PodSession::new(settings).with_id(pod_id);

    for report in reports {
        if session.is_ended() {
            break;
        }
        match decode(report) {
            Ok(Some(event)) => {
                session.apply(&event);
            }
            Ok(None) => {
                tracing::debug!(
                    "Pod {}: skipping unsuccessful {:?} at {}",
                    pod_id,
                    report.last_command.kind,
                    report.timestamp
                );
            }
            Err(e) => tracing::warn!("Pod {}: {}", pod_id, e),
        }
    }

    tracing::debug!(
        "Pod {}: replayed {} reports, phase {:?}",
        pod_id,
        reports.len(),
        session.phase()
    );
    session
}

/// Read all status reports from a pod history file
///
/// Malformed lines are logged and skipped. Reports are returned sorted by
/// timestamp.
pub fn read_pod_history(path: &Path) -> Result<Vec<DeliveryEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut reports = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<DeliveryEvent>(&line) {
            Ok(report) => reports.push(report),
            Err(e) => {
                tracing::warn!(
                    "Failed to parse report at {:?} line {}: {}",
                    path,
                    line_num + 1,
                    e
                );
            }
        }
    }

    file.unlock()?;

    reports.sort_by_key(|r| r.timestamp);
    tracing::debug!("Read {} reports from {:?}", reports.len(), path);
    Ok(reports)
}

/// Append one status report to a pod history file
pub fn append_report(path: &Path, report: &DeliveryEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;

    let mut writer = std::io::BufWriter::new(&file);
    let line = serde_json::to_string(report)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    drop(writer);

    file.unlock()?;
    Ok(())
}

/// Marker file flagging a pod as removed without a deactivation report
fn abandon_marker(history: &Path) -> PathBuf {
    history.with_extension("abandoned")
}

fn is_abandoned(history: &Path) -> bool {
    abandon_marker(history).exists()
}

/// Flag the pod recorded in `history` as abandoned
pub fn mark_abandoned(history: &Path) -> Result<()> {
    let marker = abandon_marker(history);
    if let Some(parent) = marker.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&marker, b"")?;
    tracing::info!("Marked {:?} abandoned", history);
    Ok(())
}

/// Load and replay every pod history in `dir` that overlaps `[from, to]`
///
/// A running pod with an abandon marker (see [`mark_abandoned`]) is closed
/// at its last reading. Other unterminated pods stay open and deliver
/// independently, even when their lifetimes overlap. Sessions are returned
/// ordered by start.
pub fn load_pod_sessions(
    dir: &Path,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    settings: PodSettings,
) -> Result<Vec<PodSession>> {
    if !dir.exists() {
        tracing::info!("No pod directory at {:?}", dir);
        return Ok(Vec::new());
    }

    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "jsonl") {
            continue;
        }
        let Some(pod_id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let reports = read_pod_history(&path)?;
        let mut session = replay_events(&reports, pod_id, settings);
        if session.start_time().is_none() {
            tracing::warn!("Pod {} never started, ignoring", pod_id);
            continue;
        }
        if !session.is_ended() && is_abandoned(&path) {
            tracing::info!("Pod {} marked abandoned, closing at last report", pod_id);
            session.apply(&SessionEvent::Remove);
        }
        sessions.push(session);
    }

    sessions.sort_by(|a, b| {
        a.start_time()
            .unwrap_or(f64::MIN)
            .total_cmp(&b.start_time().unwrap_or(f64::MIN))
    });

    let (from, to) = (epoch_seconds(from), epoch_seconds(to));
    sessions.retain(|s| match (s.start_time(), s.projected_end()) {
        (Some(start), Some(end)) => start <= to && end >= from,
        _ => false,
    });

    tracing::info!("Loaded {} pod sessions from {:?}", sessions.len(), dir);
    Ok(sessions)
}
