// Command protocol - RN2483 LoRaWAN class A command reference

/// Terminal keyword that completes a single-phase command successfully.
pub const OK_KEYWORD: &str = "ok";

/// Terminal keywords reporting a module-side rejection, in match order.
pub const ERROR_KEYWORDS: [&str; 9] = [
    "invalid_param",
    "keys_not_init",
    "no_free_ch",
    "silent",
    "busy",
    "mac_paused",
    "not_joined",
    "frame_counter_err_rejoin_needed",
    "invalid_data_len",
];

/// Marker prefix of a transmit outcome carrying downlink data.
pub const DOWNLINK_MARKER: &str = "mac_rx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Timeout,
}

/// Outcome of one command. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status: Status,
    pub lines: Vec<String>,
}

impl CommandResult {
    pub fn new(status: Status, lines: Vec<String>) -> Self {
        Self { status, lines }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn first_line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }
}

/// Classify a single-phase response line. `None` means "keep polling".
///
/// Matching is by containment, so `ok` is checked before any error keyword.
pub fn classify(line: &str) -> Option<Status> {
    if line.contains(OK_KEYWORD) {
        Some(Status::Ok)
    } else if ERROR_KEYWORDS.iter().any(|kw| line.contains(kw)) {
        Some(Status::Error)
    } else {
        None
    }
}

/// Keyword table for the second reply of a join or transmit command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTwo {
    pub positive: &'static [&'static str],
    pub negative: &'static [&'static str],
    /// Status given to a line that matches neither table.
    pub unrecognized: Status,
}

pub const JOIN_PHASE_TWO: PhaseTwo = PhaseTwo {
    positive: &["accepted"],
    negative: &["denied"],
    unrecognized: Status::Error,
};

pub const TRANSMIT_PHASE_TWO: PhaseTwo = PhaseTwo {
    positive: &["mac_tx_ok", DOWNLINK_MARKER],
    negative: &["mac_err", "invalid_data_len"],
    unrecognized: Status::Ok,
};

impl PhaseTwo {
    pub fn classify(&self, line: &str) -> Status {
        if self.positive.iter().any(|kw| line.contains(kw)) {
            Status::Ok
        } else if self.negative.iter().any(|kw| line.contains(kw)) {
            Status::Error
        } else {
            self.unrecognized
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    Otaa,
    Abp,
}

/// Requests understood by the module, framed to ASCII by [`ModuleCommand::to_ascii`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleCommand {
    Reset,
    FactoryReset,
    SetDevEui(String),
    SetAppEui(String),
    SetAppKey(String),
    SetDevAddr(String),
    SetNwkSKey(String),
    SetAppSKey(String),
    SetPowerIndex(u8),
    SetDatarate(u8),
    SetAdr(bool),
    SetLinkCheck(u16),
    SetRx1Delay(u16),
    SetRx2 { datarate: u8, frequency: u32 },
    SetRetransmissions(u8),
    SetChannelStatus { channel: u8, enabled: bool },
    SetDutyCycle { channel: u8, percent: u8 },
    Save,
    GetDatarate,
    GetPowerIndex,
    Join(JoinMode),
    Transmit { confirmed: bool, port: u8, payload: Vec<u8> },
}

impl ModuleCommand {
    pub fn to_ascii(&self) -> String {
        match self {
            ModuleCommand::Reset => "sys reset".to_string(),
            ModuleCommand::FactoryReset => "sys factoryRESET".to_string(),
            ModuleCommand::SetDevEui(eui) => format!("mac set deveui {eui}"),
            ModuleCommand::SetAppEui(eui) => format!("mac set appeui {eui}"),
            ModuleCommand::SetAppKey(key) => format!("mac set appkey {key}"),
            ModuleCommand::SetDevAddr(addr) => format!("mac set devaddr {addr}"),
            ModuleCommand::SetNwkSKey(key) => format!("mac set nwkskey {key}"),
            ModuleCommand::SetAppSKey(key) => format!("mac set appskey {key}"),
            ModuleCommand::SetPowerIndex(idx) => format!("mac set pwridx {idx}"),
            ModuleCommand::SetDatarate(dr) => format!("mac set dr {dr}"),
            ModuleCommand::SetAdr(on) => format!("mac set adr {}", on_off(*on)),
            ModuleCommand::SetLinkCheck(secs) => format!("mac set linkchk {secs}"),
            ModuleCommand::SetRx1Delay(ms) => format!("mac set rxdelay1 {ms}"),
            ModuleCommand::SetRx2 {
                datarate,
                frequency,
            } => format!("mac set rx2 {datarate} {frequency}"),
            ModuleCommand::SetRetransmissions(n) => format!("mac set retx {n}"),
            ModuleCommand::SetChannelStatus { channel, enabled } => {
                format!("mac set ch status {channel} {}", on_off(*enabled))
            }
            ModuleCommand::SetDutyCycle { channel, percent } => {
                format!("mac set ch dcycle {channel} {}", duty_cycle_param(*percent))
            }
            ModuleCommand::Save => "mac save".to_string(),
            ModuleCommand::GetDatarate => "mac get dr".to_string(),
            ModuleCommand::GetPowerIndex => "mac get pwridx".to_string(),
            ModuleCommand::Join(JoinMode::Otaa) => "mac join otaa".to_string(),
            ModuleCommand::Join(JoinMode::Abp) => "mac join abp".to_string(),
            ModuleCommand::Transmit {
                confirmed,
                port,
                payload,
            } => {
                let kind = if *confirmed { "cnf" } else { "uncnf" };
                format!("mac tx {kind} {port} {}", hex::encode(payload))
            }
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

/// Module duty-cycle parameter for an airtime percentage: `100 / percent - 1`.
/// Zero percent is passed through as 0, which the module reads as unrestricted.
/// Anything above 100 percent is treated as 100.
pub fn duty_cycle_param(percent: u8) -> u32 {
    if percent == 0 {
        0
    } else {
        ((100.0 / f64::from(percent.min(100))) as u32).saturating_sub(1)
    }
}

/// Transmit power in dBm for each power index, index 1 first.
pub const POWER_INDEX_DBM: [i32; 5] = [14, 12, 10, 8, 6];

pub fn power_index_to_dbm(index: u8) -> Option<i32> {
    POWER_INDEX_DBM.get(usize::from(index).checked_sub(1)?).copied()
}

pub fn dbm_to_power_index(dbm: i32) -> Option<u8> {
    POWER_INDEX_DBM
        .iter()
        .position(|&p| p == dbm)
        .map(|pos| pos as u8 + 1)
}
