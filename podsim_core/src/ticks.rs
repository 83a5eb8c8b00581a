//! Micro-dose tick scheduling.
//!
//! The pump delivers insulin in fixed quanta. A basal rate becomes a number of
//! ticks per hour, batched by the hardware into two half-hour windows. Boluses
//! are bursts of ticks squeezed in between the basal ticks.
//!
//! All instants here are epoch seconds as `f64`; templates are seconds within
//! an hour cycle.

/// Length of one hourly tick cycle in seconds
pub const CYCLE_SECONDS: f64 = 3600.0;

/// Length of one hardware batching window in seconds
pub const HALF_CYCLE_SECONDS: f64 = 1800.0;

/// Minimum distance between two delivered pulses
pub const MIN_TICK_SPACING: f64 = 2.0;

/// Each half-hour window starts this many seconds before its anchor
const WINDOW_LEAD_SECONDS: f64 = 2.0;

/// Number of quanta per hour for a rate in U/h, rounded to nearest
pub fn ticks_per_hour(rate: f64, quantum: f64) -> u32 {
    if rate <= 0.0 || quantum <= 0.0 {
        return 0;
    }
    (rate / quantum).round() as u32
}

/// Evenly spaced ticks inside one half-hour window anchored at `offset`
fn window_ticks(count: u32, offset: f64) -> Vec<f64> {
    if count == 0 {
        return Vec::new();
    }
    let interval = HALF_CYCLE_SECONDS / count as f64;
    let mut second = offset - WINDOW_LEAD_SECONDS;
    let mut seconds = Vec::with_capacity(count as usize);
    for _ in 0..count {
        second = wrap_cycle(second + interval);
        seconds.push(second);
    }
    seconds
}

/// Hourly template of `ticks_per_hour` instants within `[0, 3600)`
///
/// The count is split between the two half-hour windows; an odd count puts
/// the extra tick into the second half. The result is sorted ascending.
pub fn half_hour_ticks(ticks_per_hour: u32, offset: f64) -> Vec<f64> {
    let half = ticks_per_hour / 2;
    let mut seconds = window_ticks(half, offset);
    seconds.extend(window_ticks(
        ticks_per_hour - half,
        offset + HALF_CYCLE_SECONDS,
    ));
    seconds.sort_by(f64::total_cmp);
    seconds
}

fn wrap_cycle(second: f64) -> f64 {
    let wrapped = second.rem_euclid(CYCLE_SECONDS);
    // rem_euclid can round up to the modulus for tiny negative inputs
    if wrapped >= CYCLE_SECONDS {
        0.0
    } else {
        wrapped
    }
}

/// Replicate an hourly template across `[start, end)`, appending to `out`
///
/// The first cycle is entered at `start mod 3600`, so only template ticks
/// strictly after that phase are emitted for the first hour.
pub fn append_rate_ticks(start: f64, end: f64, template: &[f64], out: &mut Vec<f64>) {
    if template.is_empty() || end <= start {
        return;
    }

    let start_second = start.rem_euclid(CYCLE_SECONDS);
    let mut idx = template
        .iter()
        .position(|&s| s > start_second)
        .unwrap_or(template.len());
    let mut cycle_start = start - start_second;

    loop {
        if idx == template.len() {
            idx = 0;
            cycle_start += CYCLE_SECONDS;
        }
        let next = cycle_start + template[idx];
        if next >= end {
            break;
        }
        out.push(next);
        idx += 1;
    }
}

/// Insert `count` bolus ticks from `start` into a sorted schedule
pub fn insert_bolus_ticks(start: f64, count: u32, out: &mut Vec<f64>) {
    insert_bolus_ticks_with_interval(start, count, MIN_TICK_SPACING, out)
}

/// Insert bolus ticks with a pulse interval of at least 2 s
///
/// A candidate that lands too close to an existing tick is moved just past
/// it; existing ticks never move, so the schedule stays ascending.
pub fn insert_bolus_ticks_with_interval(start: f64, count: u32, interval: f64, out: &mut Vec<f64>) {
    let interval = interval.max(MIN_TICK_SPACING);
    let mut candidate = start;

    for _ in 0..count {
        let idx = out.partition_point(|&t| t <= candidate);
        let (slot, at) = find_bolus_slot(idx, candidate, out);
        out.insert(slot, at);
        candidate = at + interval;
    }
}

fn find_bolus_slot(mut idx: usize, mut candidate: f64, ticks: &[f64]) -> (usize, f64) {
    if idx > 0 {
        let previous = ticks[idx - 1];
        if candidate - previous < MIN_TICK_SPACING {
            candidate = previous + MIN_TICK_SPACING;
        }
    }

    while idx < ticks.len() && ticks[idx] - candidate < MIN_TICK_SPACING {
        candidate = ticks[idx] + MIN_TICK_SPACING;
        idx += 1;
    }

    (idx, candidate)
}
