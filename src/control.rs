//! Adaptive control loop.
//!
//! `Configuring → Joining → Transmitting ⇄ AwaitingFeedback → Adapting`,
//! ending in `Done` once the transmission budget is spent. The loop is the
//! only owner of the radio module and of [`LinkState`]; feedback reaches it
//! exclusively through the [`FeedbackReceiver`].

use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Activation, ChannelPlan, Settings};
use crate::decision::{DecisionTable, LinkChoice};
use crate::device::RadioModule;
use crate::error::{ConfigError, ControlError, DeviceError};
use crate::persistence::{Transition, TransitionLog};
use crate::protocol::{JoinMode, Status};
use crate::telemetry::{FeedbackMessage, FeedbackReceiver};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Configuring,
    Joining,
    Transmitting,
    AwaitingFeedback,
    Adapting,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub datarate: u8,
    pub power_index: u8,
    pub transmissions_sent: u32,
}

/// Parameters of one experiment run.
#[derive(Debug, Clone)]
pub struct ExperimentPlan {
    pub activation: Activation,
    pub link_check_interval: u16,
    pub channels: Vec<ChannelPlan>,
    pub max_transmissions: u32,
    pub initial: LinkChoice,
    pub adr: bool,
    pub confirmed: bool,
    pub uplink_port: u8,
    pub config_retry_delay: Duration,
}

impl ExperimentPlan {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            activation: settings.activation()?.clone(),
            link_check_interval: settings.device.link_check_interval,
            channels: settings.device.channels.clone(),
            max_transmissions: settings.experiment.max_transmissions,
            initial: LinkChoice {
                datarate: settings.experiment.initial_datarate,
                power_index: settings.experiment.initial_power_index,
            },
            adr: settings.experiment.adr,
            confirmed: settings.experiment.confirmed,
            uplink_port: settings.experiment.uplink_port,
            config_retry_delay: settings.config_retry_delay(),
        })
    }

    fn join_mode(&self) -> JoinMode {
        match self.activation {
            Activation::Abp { .. } => JoinMode::Abp,
            Activation::Otaa { .. } => JoinMode::Otaa,
        }
    }
}

#[derive(Serialize)]
struct UplinkPayload {
    #[serde(rename = "DR")]
    datarate: u8,
    #[serde(rename = "TP")]
    power_index: u8,
    #[serde(rename = "N")]
    counter: u32,
}

pub struct ControlLoop<T: Transport> {
    module: RadioModule<T>,
    feedback: FeedbackReceiver,
    table: Arc<DecisionTable>,
    plan: ExperimentPlan,
    transitions: Option<TransitionLog>,
    link: LinkState,
    state: LoopState,
    latest: Option<FeedbackMessage>,
}

impl<T: Transport> ControlLoop<T> {
    pub fn new(
        module: RadioModule<T>,
        feedback: FeedbackReceiver,
        table: Arc<DecisionTable>,
        plan: ExperimentPlan,
    ) -> Self {
        let link = LinkState {
            datarate: plan.initial.datarate,
            power_index: plan.initial.power_index,
            transmissions_sent: 0,
        };
        Self {
            module,
            feedback,
            table,
            plan,
            transitions: None,
            link,
            state: LoopState::Configuring,
            latest: None,
        }
    }

    pub fn with_transition_log(mut self, log: TransitionLog) -> Self {
        self.transitions = Some(log);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    /// Drive the state machine until the transmission budget is spent.
    pub fn run(&mut self) -> Result<LinkState, ControlError> {
        while self.state != LoopState::Done {
            let next = self.step()?;
            if next != self.state {
                debug!(from = ?self.state, to = ?next, "state change");
            }
            self.state = next;
        }
        if let Some(log) = &mut self.transitions {
            log.finish()?;
        }
        info!(transmissions = self.link.transmissions_sent, "transmission budget exhausted");
        Ok(self.link)
    }

    pub fn step(&mut self) -> Result<LoopState, ControlError> {
        match self.state {
            LoopState::Configuring => self.configure(),
            LoopState::Joining => self.join(),
            LoopState::Transmitting => self.transmit(),
            LoopState::AwaitingFeedback => Ok(self.await_feedback()),
            LoopState::Adapting => self.adapt(),
            LoopState::Done => Ok(LoopState::Done),
        }
    }

    fn budget_exhausted(&self) -> bool {
        self.link.transmissions_sent >= self.plan.max_transmissions
    }

    fn configure(&mut self) -> Result<LoopState, ControlError> {
        info!("starting factory reset");
        loop {
            let result = self.module.factory_reset()?;
            info!(status = ?result.status, lines = ?result.lines, "factory reset");
            if result.status != Status::Error {
                break;
            }
        }

        // Transient module errors are common right after a reset; retry the
        // whole sequence until it goes through cleanly.
        loop {
            let report = self.module.configure_activation(
                &self.plan.activation,
                self.plan.link_check_interval,
                &self.plan.channels,
            )?;
            if report.is_clean() {
                info!(responses = ?report.responses, "savable parameters set");
                return Ok(LoopState::Joining);
            }
            warn!(
                errors = report.errors,
                aborted_at = ?report.aborted_at,
                "configuration incomplete, retrying"
            );
            thread::sleep(self.plan.config_retry_delay);
        }
    }

    fn join(&mut self) -> Result<LoopState, ControlError> {
        let mode = self.plan.join_mode();
        info!(?mode, "joining network");
        let result = self.module.join(mode)?;
        if !result.is_ok() {
            return Err(ControlError::JoinFailed {
                status: result.status,
                responses: result.lines,
            });
        }
        info!("network joined");
        Ok(LoopState::Transmitting)
    }

    fn transmit(&mut self) -> Result<LoopState, ControlError> {
        while self.feedback.is_empty() && !self.budget_exhausted() {
            self.transmit_once()?;
        }
        Ok(LoopState::AwaitingFeedback)
    }

    fn transmit_once(&mut self) -> Result<(), ControlError> {
        let module_dr = self.read_until_valid(RadioModule::get_datarate)?;
        let module_pwr = self.read_until_valid(RadioModule::get_power_index)?;

        if module_dr != self.link.datarate || module_pwr != self.link.power_index {
            info!(
                datarate = self.link.datarate,
                power_index = self.link.power_index,
                "setting transmission parameters"
            );
            let report = self.module.configure_transmission(
                self.link.datarate,
                self.plan.adr,
                self.link.power_index,
            )?;
            if !report.is_clean() {
                return Err(ControlError::TransmissionParameters {
                    responses: report.responses,
                });
            }
        }

        let payload = serde_json::to_vec(&UplinkPayload {
            datarate: self.link.datarate,
            power_index: self.link.power_index,
            counter: self.link.transmissions_sent,
        })?;

        info!(payload = %String::from_utf8_lossy(&payload), "sending uplink");
        let result = self
            .module
            .send_uplink(&payload, self.plan.confirmed, self.plan.uplink_port)?;
        if !result.is_ok() {
            warn!(status = ?result.status, lines = ?result.lines, "uplink not confirmed by module");
        }

        self.link.transmissions_sent += 1;
        Ok(())
    }

    /// Re-issue a query until the module returns a readable value.
    fn read_until_valid(
        &mut self,
        read: fn(&mut RadioModule<T>) -> Result<u8, DeviceError>,
    ) -> Result<u8, ControlError> {
        loop {
            match read(&mut self.module) {
                Ok(value) => return Ok(value),
                Err(DeviceError::UnreadableValue { command, reply }) => {
                    debug!(%command, ?reply, "query failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn await_feedback(&mut self) -> LoopState {
        if self.budget_exhausted() {
            return LoopState::Done;
        }
        match self.feedback.recv_latest() {
            Some(message) => {
                self.latest = Some(message);
                LoopState::Adapting
            }
            None => LoopState::Transmitting,
        }
    }

    fn adapt(&mut self) -> Result<LoopState, ControlError> {
        let Some(message) = self.latest.take() else {
            return Ok(LoopState::Transmitting);
        };
        debug!(snr = message.snr, gateway = %message.gateway, "feedback received");

        let choice = match self.table.decide(message.snr, self.link.power_index) {
            Ok(choice) => choice,
            Err(e) => {
                warn!(error = %e, snr = message.snr, "no decision, keeping current parameters");
                return Ok(LoopState::Transmitting);
            }
        };

        if choice.datarate != self.link.datarate || choice.power_index != self.link.power_index {
            info!(
                datarate_from = self.link.datarate,
                datarate_to = choice.datarate,
                power_from = self.link.power_index,
                power_to = choice.power_index,
                gateway = %message.gateway,
                "link parameters changed"
            );
            if let Some(log) = &mut self.transitions {
                log.record(&Transition {
                    datarate_from: self.link.datarate,
                    datarate_to: choice.datarate,
                    power_from: self.link.power_index,
                    power_to: choice.power_index,
                    transmissions: self.link.transmissions_sent,
                    gateway: message.gateway.clone(),
                    snr: message.snr,
                })?;
            }
        }

        self.link.datarate = choice.datarate;
        self.link.power_index = choice.power_index;
        Ok(LoopState::Transmitting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::tests::table_preferring;
    use crate::device::tests::module;
    use crate::telemetry::feedback_queue;
    use crate::transport::mock::ScriptedTransport;
    use std::sync::Mutex;

    fn plan(max_transmissions: u32) -> ExperimentPlan {
        ExperimentPlan {
            activation: Activation::Abp {
                devaddr: "260B1234".into(),
                nwkskey: "AA".into(),
                appskey: "BB".into(),
            },
            link_check_interval: 0,
            channels: vec![ChannelPlan { id: 0, duty_cycle: 0 }],
            max_transmissions,
            initial: LinkChoice {
                datarate: 0,
                power_index: 1,
            },
            adr: false,
            confirmed: false,
            uplink_port: 220,
            config_retry_delay: Duration::ZERO,
        }
    }

    /// Module double that remembers datarate and power index.
    fn simulated_module(join_reply: &'static str) -> ScriptedTransport {
        let mut dr = 0u8;
        let mut pwr = 1u8;
        ScriptedTransport::new(move |cmd| {
            let lines: Vec<&str> = if cmd == "sys factoryRESET" {
                vec!["RN2483 1.0.5 Oct 31 2018 15:06:52"]
            } else if let Some(v) = cmd.strip_prefix("mac set dr ") {
                dr = v.parse().unwrap();
                vec!["ok"]
            } else if let Some(v) = cmd.strip_prefix("mac set pwridx ") {
                pwr = v.parse().unwrap();
                vec!["ok"]
            } else if cmd == "mac get dr" {
                return vec![dr.to_string()];
            } else if cmd == "mac get pwridx" {
                return vec![pwr.to_string()];
            } else if cmd.starts_with("mac join") {
                vec!["ok", join_reply]
            } else if cmd.starts_with("mac tx") {
                vec!["ok", "mac_tx_ok"]
            } else {
                vec!["ok"]
            };
            lines.into_iter().map(str::to_string).collect()
        })
    }

    fn uplinks(written: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        written
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("mac tx"))
            .cloned()
            .collect()
    }

    #[test]
    fn spends_budget_without_feedback() {
        let transport = simulated_module("accepted");
        let written = transport.written();
        let (_tx, rx) = feedback_queue();
        let mut control = ControlLoop::new(module(transport), rx, Arc::new(table_preferring(2)), plan(3));

        let link = control.run().unwrap();

        assert_eq!(link.transmissions_sent, 3);
        assert_eq!(control.state(), LoopState::Done);

        let sent = uplinks(&written);
        assert_eq!(sent.len(), 3);
        let first = hex::encode(r#"{"DR":0,"TP":1,"N":0}"#);
        assert_eq!(sent[0], format!("mac tx uncnf 220 {first}"));

        let all = written.lock().unwrap();
        assert_eq!(all[0], "sys factoryRESET");
        assert!(all.contains(&"mac join abp".to_string()));
        assert!(!all.iter().any(|c| c.starts_with("mac set dr")));
    }

    #[test]
    fn feedback_changes_link_parameters() {
        let transport = simulated_module("accepted");
        let written = transport.written();
        let (tx, rx) = feedback_queue();
        for snr in [-15.0, 7.0] {
            tx.send(FeedbackMessage {
                dev_addr: "260B1234".into(),
                snr,
                gateway: "gw-roof".into(),
            })
            .unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let log = TransitionLog::open(dir.path().join("data.txt")).unwrap();
        // action 2 = SF7 at 10 dBm
        let mut control = ControlLoop::new(module(transport), rx, Arc::new(table_preferring(2)), plan(2))
            .with_transition_log(log);

        let link = control.run().unwrap();

        assert_eq!(link.datarate, 5);
        assert_eq!(link.power_index, 3);
        assert_eq!(link.transmissions_sent, 2);

        let all = written.lock().unwrap().clone();
        assert!(all.contains(&"mac set dr 5".to_string()));
        assert!(all.contains(&"mac set pwridx 3".to_string()));
        let sent = uplinks(&written);
        assert_eq!(sent[0], format!("mac tx uncnf 220 {}", hex::encode(r#"{"DR":5,"TP":3,"N":0}"#)));

        let contents = std::fs::read_to_string(dir.path().join("data.txt")).unwrap();
        let transitions: Vec<&str> = contents.lines().filter(|l| l.contains("Datarate")).collect();
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].contains("Datarate 0 to 5"));
        assert!(transitions[0].contains("snr : 7"));
    }

    #[test]
    fn join_failure_is_fatal() {
        let (_tx, rx) = feedback_queue();
        let mut control = ControlLoop::new(
            module(simulated_module("denied")),
            rx,
            Arc::new(table_preferring(2)),
            plan(3),
        );

        let err = control.run().unwrap_err();
        assert!(matches!(err, ControlError::JoinFailed { status: Status::Error, .. }));
        assert_eq!(control.link().transmissions_sent, 0);
    }

    #[test]
    fn configuration_is_retried_until_clean() {
        let mut saves = 0;
        let transport = ScriptedTransport::new(move |cmd| {
            let reply = match cmd {
                "mac save" => {
                    saves += 1;
                    if saves == 1 { "busy" } else { "ok" }
                }
                "mac get dr" => "0",
                "mac get pwridx" => "1",
                c if c.starts_with("mac join") => return vec!["ok".into(), "accepted".into()],
                c if c.starts_with("mac tx") => return vec!["ok".into(), "mac_tx_ok".into()],
                _ => "ok",
            };
            vec![reply.to_string()]
        });
        let written = transport.written();
        let (_tx, rx) = feedback_queue();
        let mut control = ControlLoop::new(module(transport), rx, Arc::new(table_preferring(2)), plan(1));

        control.run().unwrap();

        let devaddr_sets = written
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with("mac set devaddr"))
            .count();
        assert_eq!(devaddr_sets, 2);
    }

    #[test]
    fn rejected_transmission_parameters_are_fatal() {
        let transport = ScriptedTransport::new(|cmd| {
            let reply = match cmd {
                "mac get dr" => "3",
                "mac get pwridx" => "1",
                c if c.starts_with("mac set dr") => "invalid_param",
                c if c.starts_with("mac join") => return vec!["ok".into(), "accepted".into()],
                _ => "ok",
            };
            vec![reply.to_string()]
        });
        let (_tx, rx) = feedback_queue();
        let mut control = ControlLoop::new(module(transport), rx, Arc::new(table_preferring(2)), plan(3));

        assert!(matches!(
            control.run(),
            Err(ControlError::TransmissionParameters { .. })
        ));
    }

    #[test]
    fn unmappable_decision_keeps_parameters() {
        let (tx, rx) = feedback_queue();
        tx.send(FeedbackMessage {
            dev_addr: "260B1234".into(),
            snr: 0.0,
            gateway: "gw".into(),
        })
        .unwrap();
        // action 32 = SF13, which has no datarate
        let mut control = ControlLoop::new(
            module(simulated_module("accepted")),
            rx,
            Arc::new(table_preferring(32)),
            plan(1),
        );

        let link = control.run().unwrap();
        assert_eq!((link.datarate, link.power_index), (0, 1));
    }
}
