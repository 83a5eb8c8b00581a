use chrono::{DateTime, Utc};
use podsim_core::export::write_model_csv;
use podsim_core::model::{build_data_model, DataModel, ModelInputs, ModelWindow, WhatIf};
use podsim_core::records::{injections_between, load_glucose, load_injections};
use podsim_core::series::{from_epoch_seconds, minute_start};
use podsim_core::telemetry::{
    append_report, load_pod_sessions, mark_abandoned, read_pod_history, replay_events,
};
use podsim_core::*;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "podsim")]
#[command(about = "Insulin pod delivery reconstruction and action simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay one pod's report history and summarize the session
    Replay {
        /// JSONL file of pod status reports
        file: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Append new reports from a JSONL file to a pod's history
    Import {
        /// JSONL file of pod status reports
        file: PathBuf,

        /// Pod id (defaults to the file name)
        #[arg(long)]
        pod: Option<String>,
    },

    /// Mark a pod as removed without a deactivation report
    Abandon {
        /// Pod id
        pod: String,
    },

    /// Build the per-minute data model around a point in time
    Simulate {
        /// Reference time (RFC 3339), defaults to the current time
        #[arg(long)]
        now: Option<String>,

        /// Hours of history to include
        #[arg(long, default_value_t = 8)]
        hours_prev: u32,

        /// Hours of forecast to include
        #[arg(long, default_value_t = 4)]
        hours_next: u32,

        /// Patient weight in kg
        #[arg(long)]
        weight: Option<f64>,

        /// Patient height in cm
        #[arg(long)]
        height: Option<f64>,

        /// Project a delivery suspension of this many minutes from now
        #[arg(long, conflicts_with = "temp_basal")]
        suspend_minutes: Option<u32>,

        /// Project a temp basal from now, as RATE:MINUTES
        #[arg(long, conflicts_with = "suspend_minutes")]
        temp_basal: Option<String>,

        /// CSV output path (defaults to model.csv in the data directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    podsim_core::logging::init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(data_dir) = cli.data_dir {
        config.data.data_dir = data_dir;
    }

    match cli.command {
        Commands::Replay { file, json } => cmd_replay(&file, json, &config),
        Commands::Import { file, pod } => cmd_import(&file, pod, &config),
        Commands::Abandon { pod } => cmd_abandon(&pod, &config),
        Commands::Simulate {
            now,
            hours_prev,
            hours_next,
            weight,
            height,
            suspend_minutes,
            temp_basal,
            out,
        } => {
            let now = match now {
                Some(raw) => parse_time(&raw)?,
                None => Utc::now(),
            };
            if let Some(weight) = weight {
                config.patient.weight_kg = weight;
            }
            if let Some(height) = height {
                config.patient.height_cm = height;
            }
            config.validate()?;

            let what_if = match (suspend_minutes, temp_basal) {
                (Some(minutes), _) => Some(WhatIf::Suspend { minutes }),
                (None, Some(raw)) => Some(parse_temp_basal(&raw)?),
                (None, None) => None,
            };
            let window = ModelWindow::around(now, hours_prev, hours_next);
            cmd_simulate(window, what_if, out, &config)
        }
    }
}

fn cmd_replay(file: &Path, json: bool, config: &Config) -> Result<()> {
    let reports = read_pod_history(file)?;
    if reports.is_empty() {
        println!("No reports found in {}", file.display());
        return Ok(());
    }

    let pod_id = pod_id_of(file);
    let session = replay_events(&reports, &pod_id, config.pod);

    if json {
        let summary = serde_json::json!({
            "pod_id": pod_id,
            "reports": reports.len(),
            "phase": session.phase(),
            "activation": session.activation().map(from_epoch_seconds),
            "start": session.start_time().map(from_epoch_seconds),
            "end": session.end_time().map(from_epoch_seconds),
            "projected_end": session.projected_end().map(from_epoch_seconds),
            "basal_rate": session.basal_rate(),
            "temp_basals": session.overrides().len(),
            "boluses": session.boluses().len(),
            "delivered_units": session.delivered_since_start(),
            "reservoir_units": session.reservoir_remaining(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("\n╭─────────────────────────────────────────╮");
    println!("│  POD {}", pod_id);
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!("  Reports:     {}", reports.len());
    println!("  Phase:       {:?}", session.phase());
    if let Some(start) = session.start_time() {
        println!("  Started:     {}", from_epoch_seconds(start).to_rfc3339());
    }
    match (session.end_time(), session.projected_end()) {
        (Some(end), _) => println!("  Ended:       {}", from_epoch_seconds(end).to_rfc3339()),
        (None, Some(end)) => println!(
            "  Expires:     {}",
            from_epoch_seconds(end).to_rfc3339()
        ),
        (None, None) => {}
    }
    println!("  Basal:       {:.2} U/h", session.basal_rate());
    println!("  Temp basals: {}", session.overrides().len());
    println!("  Boluses:     {}", session.boluses().len());
    println!("  Delivered:   {:.2} U", session.delivered_since_start());
    println!("  Reservoir:   {:.2} U", session.reservoir_remaining());
    println!();

    Ok(())
}

fn cmd_import(file: &Path, pod: Option<String>, config: &Config) -> Result<()> {
    let reports = read_pod_history(file)?;
    let pod_id = pod.unwrap_or_else(|| pod_id_of(file));
    let target = config.data.pods_dir().join(format!("{}.jsonl", pod_id));

    // histories are append-only, so anything up to the last stored report is known
    let latest = read_pod_history(&target)?.last().map(|r| r.timestamp);
    let mut imported = 0;
    for report in &reports {
        if latest.map_or(true, |latest| report.timestamp > latest) {
            append_report(&target, report)?;
            imported += 1;
        }
    }

    println!("✓ Imported {} reports into pod {}", imported, pod_id);
    if imported < reports.len() {
        println!("  {} already present", reports.len() - imported);
    }
    println!("  History: {}", target.display());
    Ok(())
}

fn cmd_abandon(pod: &str, config: &Config) -> Result<()> {
    let history = config.data.pods_dir().join(format!("{}.jsonl", pod));
    if !history.exists() {
        return Err(Error::Other(format!("No history for pod {}", pod)));
    }
    mark_abandoned(&history)?;
    println!("✓ Pod {} marked abandoned", pod);
    Ok(())
}

fn cmd_simulate(
    window: ModelWindow,
    what_if: Option<WhatIf>,
    out: Option<PathBuf>,
    config: &Config,
) -> Result<()> {
    let from = minute_start(window.precursor_start());
    let to = minute_start(window.end + 1);

    let sessions = load_pod_sessions(&config.data.pods_dir(), from, to, config.pod)?;
    let glucose = load_glucose(
        &config.data.glucose_path(),
        config.glucose.max_fill_minutes,
        config.glucose.include_manual,
    )?;
    let injections = injections_between(
        &load_injections(&config.data.injections_path())?,
        from,
        to,
    );
    tracing::info!(
        "Simulating {} pod sessions and {} injections",
        sessions.len(),
        injections.len()
    );

    let inputs = ModelInputs {
        sessions: &sessions,
        injections: &injections,
        glucose: &glucose,
        patient: config.patient,
    };
    let model = build_data_model(&inputs, window, &config.model, what_if)?;

    let out_path = out.unwrap_or_else(|| config.data.data_dir.join("model.csv"));
    let written = write_model_csv(&out_path, &model)?;

    display_summary(&model, sessions.len(), injections.len(), what_if);
    println!("✓ Wrote {} rows to {}", written, out_path.display());

    Ok(())
}

fn display_summary(model: &DataModel, sessions: usize, injections: usize, what_if: Option<WhatIf>) {
    println!("\n╭─────────────────────────────────────────╮");
    println!("│  MODEL {}", minute_start(model.window.now).to_rfc3339());
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!(
        "  Window:      {} .. {}",
        minute_start(model.window.start).to_rfc3339(),
        minute_start(model.window.end).to_rfc3339()
    );
    println!("  Pods:        {}", sessions);
    println!("  Injections:  {}", injections);
    match what_if {
        Some(WhatIf::Suspend { minutes }) => println!("  What-if:     suspend {} min", minutes),
        Some(WhatIf::TempBasal { rate, minutes }) => {
            println!("  What-if:     temp basal {:.2} U/h for {} min", rate, minutes)
        }
        None => {}
    }

    if let Some(row) = model.current() {
        println!();
        match row.glucose {
            Some(glucose) => println!("  Glucose:     {:.0} mg/dl", glucose),
            None => println!("  Glucose:     -"),
        }
        if let Some(rate) = row.glucose_rate {
            println!("  Trend:       {:+.2} mg/dl/min", rate);
        }
        if let Some(rate) = row.infusion_rate {
            println!("  Infusion:    {:.2} U/h", rate);
        }
        println!("  On board:    {:.3} U", row.insulin_on_board);
    }
    println!("  Effect floor: {:.3}", model.effect_floor);
    println!();
}

fn pod_id_of(file: &Path) -> String {
    file.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pod".to_string())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Invalid --now {:?}: {}", raw, e)))
}

fn parse_temp_basal(raw: &str) -> Result<WhatIf> {
    let invalid = || Error::Other(format!("Invalid --temp-basal {:?}, expected RATE:MINUTES", raw));
    let (rate, minutes) = raw.split_once(':').ok_or_else(invalid)?;
    let rate: f64 = rate.trim().parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.trim().parse().map_err(|_| invalid())?;
    if rate < 0.0 || minutes == 0 {
        return Err(invalid());
    }
    Ok(WhatIf::TempBasal { rate, minutes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_temp_basal() {
        assert_eq!(
            parse_temp_basal("0.5:90").unwrap(),
            WhatIf::TempBasal {
                rate: 0.5,
                minutes: 90
            }
        );
        assert!(parse_temp_basal("0.5").is_err());
        assert!(parse_temp_basal("-1:30").is_err());
        assert!(parse_temp_basal("1:0").is_err());
    }

    #[test]
    fn test_parse_time() {
        let at = parse_time("2024-03-01T12:00:00+01:00").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-03-01T11:00:00+00:00");
        assert!(parse_time("yesterday").is_err());
    }
}
