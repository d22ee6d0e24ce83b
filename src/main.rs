use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lora_link_agent::config::Settings;
use lora_link_agent::control::{ControlLoop, ExperimentPlan};
use lora_link_agent::decision::DecisionTable;
use lora_link_agent::device::RadioModule;
use lora_link_agent::engine::CommandEngine;
use lora_link_agent::mqtt::FeedbackListener;
use lora_link_agent::persistence::{RawTelemetryLog, TransitionLog, run_stamp};
use lora_link_agent::telemetry::{FeedbackIngestor, feedback_queue};
use lora_link_agent::transport::SerialTransport;

/// Adaptive datarate and transmit power agent for an RN2483 end device.
#[derive(Parser, Debug)]
#[command(name = "lora_link_agent", version)]
struct Cli {
    /// Settings file (TOML). Missing sections fall back to defaults.
    #[arg(long, default_value = "config/agent.toml")]
    config: PathBuf,

    /// Serial device of the module.
    #[arg(long)]
    port: Option<String>,

    /// Decision table (JSON).
    #[arg(long)]
    decision_table: Option<PathBuf>,

    /// Directory for the experiment audit logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of uplinks to send before stopping.
    #[arg(long)]
    max_transmissions: Option<u32>,

    /// Broker password.
    #[arg(long, env = "LORA_MQTT_PASSWORD", hide_env_values = true)]
    mqtt_password: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(port) = &self.port {
            settings.serial.port = port.clone();
        }
        if let Some(path) = &self.decision_table {
            settings.paths.decision_table = path.clone();
        }
        if let Some(dir) = &self.log_dir {
            settings.paths.log_dir = dir.clone();
        }
        if let Some(n) = self.max_transmissions {
            settings.experiment.max_transmissions = n;
        }
        if let Some(password) = &self.mqtt_password {
            settings.mqtt.password = Some(password.clone());
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = if cli.config.exists() {
        Settings::load_from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        warn!(path = %cli.config.display(), "settings file not found, using defaults");
        Settings::default()
    };
    cli.apply(&mut settings);

    let plan = ExperimentPlan::from_settings(&settings).context("incomplete device settings")?;
    let feedback_address = settings.feedback_address()?;

    let table = DecisionTable::load_from_file(&settings.paths.decision_table)
        .with_context(|| format!("loading {}", settings.paths.decision_table.display()))?;
    let table = Arc::new(table);

    let stamp = run_stamp(Local::now());
    let log_dir = &settings.paths.log_dir;
    let raw_log = RawTelemetryLog::for_run(log_dir, &stamp).context("opening telemetry log")?;
    let mut transitions = TransitionLog::for_run(log_dir, &stamp).context("opening transition log")?;
    transitions.start(&stamp)?;

    info!(
        port = %settings.serial.port,
        broker = %settings.mqtt.host,
        device = %feedback_address,
        budget = plan.max_transmissions,
        log = %transitions.path().display(),
        "lora_link_agent starting"
    );

    let (tx, rx) = feedback_queue();
    let ingestor = FeedbackIngestor::new(feedback_address, tx).with_raw_log(raw_log);
    let listener = FeedbackListener::start(&settings.mqtt, ingestor)
        .context("connecting to the MQTT broker")?;

    let transport = SerialTransport::open(&settings.serial.port, settings.serial.baud_rate)
        .with_context(|| format!("opening serial port {}", settings.serial.port))?;
    let module = RadioModule::new(CommandEngine::new(transport));

    let mut control = ControlLoop::new(module, rx, table, plan).with_transition_log(transitions);
    let link = control.run()?;

    info!(
        transmissions = link.transmissions_sent,
        datarate = link.datarate,
        power_index = link.power_index,
        "experiment finished"
    );

    if let Err(e) = listener.stop() {
        warn!(error = %e, "broker disconnect failed");
    }
    Ok(())
}
