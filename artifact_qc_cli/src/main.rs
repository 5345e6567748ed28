use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use artifact_qc::{
    run_all, validate::validate_channel, ArtifactKind, ArtifactReport, ArtifactSummary,
    InMemoryRecording, ModalitySummary, QcParams, Recording, SensorType, StrategyChoice,
};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "MEG cardiac/ocular artifact QC", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rank sensor channels by ECG/EOG contamination
    Run(RunArgs),
    /// Validate the recorded ECG/EOG channel only
    CheckChannel(CheckArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Recording bundle (JSON)
    #[arg(value_hint = ValueHint::FilePath)]
    bundle: PathBuf,

    /// Parameter file (JSON); missing fields use defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    /// Artifact kind to analyse
    #[arg(long, value_enum, default_value = "both")]
    kind: KindOpt,

    /// Affectedness strategy
    #[arg(long, value_enum)]
    strategy: Option<StrategyOpt>,

    /// Sensor types (comma separated: mag,grad)
    #[arg(long)]
    sensors: Option<String>,

    /// Summary JSON path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Ranked channel CSV path
    #[arg(long, value_hint = ValueHint::FilePath)]
    csv: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Recording bundle (JSON)
    #[arg(value_hint = ValueHint::FilePath)]
    bundle: PathBuf,

    /// Parameter file (JSON); missing fields use defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    params: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "ecg")]
    kind: SingleKindOpt,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum KindOpt {
    Ecg,
    Eog,
    Both,
}

impl KindOpt {
    fn kinds(self) -> Vec<ArtifactKind> {
        match self {
            KindOpt::Ecg => vec![ArtifactKind::Ecg],
            KindOpt::Eog => vec![ArtifactKind::Eog],
            KindOpt::Both => ArtifactKind::ALL.to_vec(),
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SingleKindOpt {
    Ecg,
    Eog,
}

impl From<SingleKindOpt> for ArtifactKind {
    fn from(value: SingleKindOpt) -> Self {
        match value {
            SingleKindOpt::Ecg => ArtifactKind::Ecg,
            SingleKindOpt::Eog => ArtifactKind::Eog,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StrategyOpt {
    Auto,
    MeanThreshold,
}

impl From<StrategyOpt> for StrategyChoice {
    fn from(value: StrategyOpt) -> Self {
        match value {
            StrategyOpt::Auto => StrategyChoice::Auto,
            StrategyOpt::MeanThreshold => StrategyChoice::MeanThreshold,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Run(args) => args.verbose,
        Command::CheckChannel(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::CheckChannel(args) => handle_check(args),
    }
}

fn handle_run(args: RunArgs) -> Result<()> {
    let mut params = load_params(args.params.as_deref())?;
    if let Some(strategy) = args.strategy {
        params.strategy = strategy.into();
    }
    if let Some(list) = args.sensors.as_deref() {
        params.sensors = parse_sensor_list(list)?;
    }
    params.validate().context("invalid parameters")?;

    let recording = load_bundle(&args.bundle)?;
    let kinds = args.kind.kinds();

    let started = Instant::now();
    let reports = run_all(&recording, &kinds, &params)
        .with_context(|| format!("analysis of {} failed", args.bundle.display()))?;
    info!(
        "Analysed {} artifact kind(s) in {:.2?}",
        reports.len(),
        started.elapsed()
    );
    for report in &reports {
        log_report(report);
    }

    let summaries: Vec<&ArtifactSummary> = reports.iter().map(|r| &r.summary).collect();
    let json = serde_json::to_string_pretty(&summaries)?;
    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{json}")?;
    } else {
        fs::write(&args.output, json)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Summary written: {}", args.output.display());
    }

    if let Some(path) = args.csv.as_deref() {
        write_ranked_csv(&reports, path)?;
        info!("Ranked channels written: {}", path.display());
    }
    Ok(())
}

fn handle_check(args: CheckArgs) -> Result<()> {
    let params = load_params(args.params.as_deref())?;
    let recording = load_bundle(&args.bundle)?;
    let kind: ArtifactKind = args.kind.into();
    let channels = recording.reference_channels(kind);
    let Some(&(name, samples)) = channels.first() else {
        return Err(anyhow!("{} has no {} channel", args.bundle.display(), kind));
    };
    if channels.len() > 1 {
        warn!("{} {} channels found, checking {}", channels.len(), kind, name);
    }
    let report = validate_channel(
        name,
        samples,
        recording.sample_rate(),
        kind,
        params.for_kind(kind),
    )
    .with_context(|| format!("failed to validate {name}"))?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{}", report.describe())?;
    writeln!(
        handle,
        "events={} amplitude_std={:.4} breaks={} bursts={}",
        report.peaks.len(),
        report.amplitude_std,
        report.n_breaks,
        report.n_bursts
    )?;
    Ok(())
}

fn load_params(path: Option<&Path>) -> Result<QcParams> {
    let Some(path) = path else {
        return Ok(QcParams::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a valid parameter file", path.display()))
}

fn load_bundle(path: &Path) -> Result<InMemoryRecording> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let recording: InMemoryRecording = serde_json::from_reader(io::BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if !(recording.sfreq > 0.0) {
        return Err(anyhow!(
            "{}: sampling frequency must be positive",
            path.display()
        ));
    }
    Ok(recording)
}

fn parse_sensor_list(input: &str) -> Result<Vec<SensorType>> {
    let mut out = Vec::new();
    for token in input.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let sensor: SensorType = trimmed
            .parse()
            .with_context(|| format!("invalid sensor type '{}'", trimmed))?;
        if !out.contains(&sensor) {
            out.push(sensor);
        }
    }
    if out.is_empty() {
        return Err(anyhow!("no sensor types given"));
    }
    Ok(out)
}

fn log_report(report: &ArtifactReport) {
    let summary = &report.summary;
    match summary.method {
        Some(method) => info!("{}: {} ({})", summary.kind, method, summary.reference_status),
        None => warn!("{}: {}", summary.kind, summary.reference_status),
    }
    for (sensor, modality) in &summary.modalities {
        match modality {
            ModalitySummary::Details { channels, status } => {
                let top: Vec<&str> = channels.iter().take(5).map(|v| v.channel.as_str()).collect();
                info!("  {}: {} channels, top: {}", sensor, channels.len(), top.join(", "));
                if let Some(status) = status {
                    info!("  {}: {}", sensor, status);
                }
            }
            ModalitySummary::Status(status) => info!("  {}: {}", sensor, status),
        }
    }
}

fn write_ranked_csv(reports: &[ArtifactReport], path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_ranked_rows(reports, &mut writer)
}

fn write_ranked_rows<W: Write>(reports: &[ArtifactReport], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "kind",
        "sensor",
        "method",
        "rank",
        "channel",
        "tier_or_status",
        "value",
        "p_value",
        "lobe",
    ])?;

    for report in reports {
        let summary = &report.summary;
        let kind = summary.kind.to_string();
        let method = summary
            .method
            .map(|m| m.to_string())
            .unwrap_or_default();
        for (sensor, modality) in &summary.modalities {
            match modality {
                ModalitySummary::Details { channels, .. } => {
                    for (rank, v) in channels.iter().enumerate() {
                        writer.write_record([
                            kind.clone(),
                            sensor.to_string(),
                            method.clone(),
                            (rank + 1).to_string(),
                            v.channel.clone(),
                            v.group.clone(),
                            format!("{:.6e}", v.value),
                            v.p_value
                                .map(|p| format!("{:.6e}", p))
                                .unwrap_or_default(),
                            v.lobe.clone().unwrap_or_default(),
                        ])?;
                    }
                }
                ModalitySummary::Status(status) => {
                    writer.write_record([
                        kind.clone(),
                        sensor.to_string(),
                        method.clone(),
                        String::new(),
                        String::new(),
                        status.clone(),
                        String::new(),
                        String::new(),
                        String::new(),
                    ])?;
                }
            }
        }
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_list_parses_and_dedups() {
        let sensors = parse_sensor_list("mag, grads,mag").unwrap();
        assert_eq!(sensors, vec![SensorType::Mag, SensorType::Grad]);
        assert!(parse_sensor_list(" , ").is_err());
        assert!(parse_sensor_list("eeg").is_err());
    }

    #[test]
    fn csv_lists_status_rows_for_aborted_runs() {
        let recording = InMemoryRecording::new(1000.0);
        let reports = run_all(&recording, &[ArtifactKind::Ecg], &QcParams::default()).unwrap();
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_ranked_rows(&reports, &mut writer).unwrap();
        let bytes = writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "kind,sensor,method,rank,channel,tier_or_status,value,p_value,lobe");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("ECG,mag,,,,"));
    }
}
