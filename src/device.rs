//! Multi-step configuration sequences over the command engine.
//!
//! Identity and key parameters are required: the first failure aborts the
//! sequence. Channel setup and `mac save` are tolerated: failures are counted
//! and the sequence carries on.

use tracing::{debug, error, info};

use crate::config::{Activation, ChannelPlan, CommandTimeouts, DISABLED_CHANNEL_BANK};
use crate::engine::{CommandEngine, DualPhaseResult};
use crate::error::{DeviceError, EngineError};
use crate::parser::parse_value;
use crate::protocol::{
    CommandResult, JOIN_PHASE_TWO, JoinMode, ModuleCommand, TRANSMIT_PHASE_TWO,
};
use crate::transport::Transport;

/// Outcome of a configuration sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigReport {
    /// Number of failed steps. A required-step failure reports exactly 1.
    pub errors: usize,
    /// Raw module lines of every step attempted, in order.
    pub responses: Vec<String>,
    /// Required parameter that aborted the sequence, if any.
    pub aborted_at: Option<&'static str>,
}

impl ConfigReport {
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }

    fn abort(mut self, parameter: &'static str) -> Self {
        error!(parameter, "could not set required parameter");
        self.errors = 1;
        self.aborted_at = Some(parameter);
        self
    }
}

pub struct RadioModule<T: Transport> {
    engine: CommandEngine<T>,
    timeouts: CommandTimeouts,
}

impl<T: Transport> RadioModule<T> {
    pub fn new(engine: CommandEngine<T>) -> Self {
        Self::with_timeouts(engine, CommandTimeouts::default())
    }

    pub fn with_timeouts(engine: CommandEngine<T>, timeouts: CommandTimeouts) -> Self {
        Self { engine, timeouts }
    }

    pub fn into_engine(self) -> CommandEngine<T> {
        self.engine
    }

    pub fn run(&mut self, command: &ModuleCommand) -> Result<CommandResult, EngineError> {
        let ascii = command.to_ascii();
        let result = self.engine.execute(&ascii, self.timeouts.config)?;
        debug!(command = %ascii, status = ?result.status, lines = ?result.lines, "module reply");
        Ok(result)
    }

    pub fn reset(&mut self) -> Result<CommandResult, EngineError> {
        self.run(&ModuleCommand::Reset)
    }

    pub fn factory_reset(&mut self) -> Result<CommandResult, EngineError> {
        self.run(&ModuleCommand::FactoryReset)
    }

    pub fn get_datarate(&mut self) -> Result<u8, DeviceError> {
        self.query(ModuleCommand::GetDatarate)
    }

    pub fn get_power_index(&mut self) -> Result<u8, DeviceError> {
        self.query(ModuleCommand::GetPowerIndex)
    }

    fn query(&mut self, command: ModuleCommand) -> Result<u8, DeviceError> {
        let ascii = command.to_ascii();
        let result = self.engine.execute(&ascii, self.timeouts.query)?;
        let value = if result.is_ok() {
            result.first_line().and_then(parse_value)
        } else {
            None
        };
        value.ok_or(DeviceError::UnreadableValue {
            command: ascii,
            reply: result.lines,
        })
    }

    pub fn configure_abp(
        &mut self,
        devaddr: &str,
        nwkskey: &str,
        appskey: &str,
        link_check_interval: u16,
        channels: &[ChannelPlan],
    ) -> Result<ConfigReport, EngineError> {
        let required = [
            ("devaddr", ModuleCommand::SetDevAddr(devaddr.to_string())),
            ("nwkskey", ModuleCommand::SetNwkSKey(nwkskey.to_string())),
            ("appskey", ModuleCommand::SetAppSKey(appskey.to_string())),
            ("linkchk", ModuleCommand::SetLinkCheck(link_check_interval)),
        ];
        self.configure_savable(&required, channels)
    }

    pub fn configure_otaa(
        &mut self,
        deveui: &str,
        appeui: &str,
        appkey: &str,
        link_check_interval: u16,
        channels: &[ChannelPlan],
    ) -> Result<ConfigReport, EngineError> {
        let required = [
            ("deveui", ModuleCommand::SetDevEui(deveui.to_string())),
            ("appeui", ModuleCommand::SetAppEui(appeui.to_string())),
            ("appkey", ModuleCommand::SetAppKey(appkey.to_string())),
            ("linkchk", ModuleCommand::SetLinkCheck(link_check_interval)),
        ];
        self.configure_savable(&required, channels)
    }

    /// Run the sequence matching the configured activation mode.
    pub fn configure_activation(
        &mut self,
        activation: &Activation,
        link_check_interval: u16,
        channels: &[ChannelPlan],
    ) -> Result<ConfigReport, EngineError> {
        match activation {
            Activation::Abp {
                devaddr,
                nwkskey,
                appskey,
            } => self.configure_abp(devaddr, nwkskey, appskey, link_check_interval, channels),
            Activation::Otaa {
                deveui,
                appeui,
                appkey,
            } => self.configure_otaa(deveui, appeui, appkey, link_check_interval, channels),
        }
    }

    fn configure_savable(
        &mut self,
        required: &[(&'static str, ModuleCommand)],
        channels: &[ChannelPlan],
    ) -> Result<ConfigReport, EngineError> {
        let mut report = ConfigReport::default();

        for (parameter, command) in required {
            let result = self.run(command)?;
            report.responses.extend(result.lines.iter().cloned());
            if !result.is_ok() {
                return Ok(report.abort(*parameter));
            }
        }

        for channel in DISABLED_CHANNEL_BANK {
            let result = self.run(&ModuleCommand::SetChannelStatus {
                channel,
                enabled: false,
            })?;
            if !tally(&mut report, result) {
                error!(channel, "error disabling channel");
            }
        }

        debug!(count = channels.len(), "enabling channels");
        for plan in channels {
            let enabled = self.run(&ModuleCommand::SetChannelStatus {
                channel: plan.id,
                enabled: true,
            })?;
            if !tally(&mut report, enabled) {
                error!(channel = plan.id, "error enabling channel");
            }

            let duty = self.run(&ModuleCommand::SetDutyCycle {
                channel: plan.id,
                percent: plan.duty_cycle,
            })?;
            if !tally(&mut report, duty) {
                error!(channel = plan.id, duty_cycle = plan.duty_cycle, "error setting duty cycle");
            }
        }

        let saved = self.run(&ModuleCommand::Save)?;
        if !tally(&mut report, saved) {
            error!("error saving parameters");
        }

        info!(errors = report.errors, "savable parameters configured");
        Ok(report)
    }

    /// Set datarate, ADR and power index. Fails fast on the first rejection.
    pub fn configure_transmission(
        &mut self,
        datarate: u8,
        adr: bool,
        power_index: u8,
    ) -> Result<ConfigReport, EngineError> {
        let steps = [
            ("dr", ModuleCommand::SetDatarate(datarate)),
            ("adr", ModuleCommand::SetAdr(adr)),
            ("pwridx", ModuleCommand::SetPowerIndex(power_index)),
        ];

        let mut report = ConfigReport::default();
        for (parameter, command) in &steps {
            let result = self.run(command)?;
            report.responses.extend(result.lines.iter().cloned());
            if !result.is_ok() {
                return Ok(report.abort(*parameter));
            }
        }
        Ok(report)
    }

    pub fn set_rx1_delay(&mut self, delay_ms: u16) -> Result<CommandResult, EngineError> {
        self.run(&ModuleCommand::SetRx1Delay(delay_ms))
    }

    pub fn set_rx2(&mut self, datarate: u8, frequency: u32) -> Result<CommandResult, EngineError> {
        self.run(&ModuleCommand::SetRx2 {
            datarate,
            frequency,
        })
    }

    pub fn set_retransmissions(&mut self, count: u8) -> Result<CommandResult, EngineError> {
        self.run(&ModuleCommand::SetRetransmissions(count))
    }

    pub fn join(&mut self, mode: JoinMode) -> Result<DualPhaseResult, EngineError> {
        let ascii = ModuleCommand::Join(mode).to_ascii();
        let result = self.engine.execute_dual(
            &ascii,
            self.timeouts.config,
            self.timeouts.phase_two,
            &JOIN_PHASE_TWO,
        )?;
        if !result.is_ok() {
            error!(status = ?result.status, lines = ?result.lines, "error joining the network");
        }
        Ok(result)
    }

    pub fn send_uplink(
        &mut self,
        payload: &[u8],
        confirmed: bool,
        port: u8,
    ) -> Result<DualPhaseResult, EngineError> {
        let ascii = ModuleCommand::Transmit {
            confirmed,
            port,
            payload: payload.to_vec(),
        }
        .to_ascii();
        let result = self.engine.execute_dual(
            &ascii,
            self.timeouts.config,
            self.timeouts.phase_two,
            &TRANSMIT_PHASE_TWO,
        )?;
        if let Some(downlink) = &result.downlink {
            info!(port = downlink.port, message = %downlink.message, "downlink received");
        }
        Ok(result)
    }
}

/// Record a tolerated step. Returns whether it succeeded.
fn tally(report: &mut ConfigReport, result: CommandResult) -> bool {
    let ok = result.is_ok();
    report.responses.extend(result.lines);
    if !ok {
        report.errors += 1;
    }
    ok
}
