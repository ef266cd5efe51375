// ── Single-use bus commands ──
//
// Every bus operation is minted as a command object holding its owning
// BusMaster and an immutable request, executes at most once, and ends in
// a terminal status drawn from a closed per-kind enum. Executing twice,
// or reading success-only fields of a command that has not succeeded,
// violates the contract and panics: those are programmer errors, not
// runtime conditions.
//
// Successful unfiltered searches additionally feed the owning master's
// matching search notifier before `execute` returns, which is how the
// notification layer learns of new results. Family-filtered enumerations
// are not fed to the notification cache -- they describe a subset.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use owlink_bus::{
    DeviceAddress, PowerSupply, ScratchpadData, SearchData, SearchQuery, TransportError,
};

use crate::master::BusMaster;

// ── Search ──────────────────────────────────────────────────────────

/// Terminal status of a [`SearchCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchStatus {
    Success(Arc<SearchData>),
    BusNotStarted,
    CommunicationError { reason: String },
}

/// Enumerates device addresses visible on the owning master's bus.
pub struct SearchCommand {
    master: BusMaster,
    query: SearchQuery,
    status: Option<SearchStatus>,
}

impl SearchCommand {
    pub(crate) fn new(master: BusMaster, query: SearchQuery) -> Self {
        Self {
            master,
            query,
            status: None,
        }
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    /// Perform the search exactly once.
    pub async fn execute(&mut self) -> &SearchStatus {
        assert!(
            self.status.is_none(),
            "SearchCommand::execute called twice"
        );

        let status = if self.master.is_started() {
            match self.master.transport().search(self.query).await {
                Ok(data) => {
                    let data = Arc::new(data);
                    if self.query.family.is_none() {
                        self.master
                            .on_search_completed(self.query.kind, Arc::clone(&data))
                            .await;
                    }
                    SearchStatus::Success(data)
                }
                Err(TransportError::NotStarted) => SearchStatus::BusNotStarted,
                Err(err) => SearchStatus::CommunicationError {
                    reason: err.to_string(),
                },
            }
        } else {
            SearchStatus::BusNotStarted
        };

        self.status.insert(status)
    }

    /// Terminal status. Panics if the command has not executed.
    pub fn status(&self) -> &SearchStatus {
        self.status
            .as_ref()
            .expect("SearchCommand status read before execute")
    }

    /// Success payload. Panics on a non-success status.
    pub fn data(&self) -> &Arc<SearchData> {
        match self.status() {
            SearchStatus::Success(data) => data,
            other => panic!("SearchCommand data read on non-success status: {other:?}"),
        }
    }

    /// Completion time by the issuing master's clock. Panics on non-success.
    pub fn completed_at(&self) -> DateTime<Utc> {
        self.data().completed_at
    }
}

// ── Convert T ───────────────────────────────────────────────────────

/// Terminal status of a [`ConvertTCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertStatus {
    Success { completed_at: DateTime<Utc> },
    BusNotStarted,
    CommunicationError { reason: String },
}

/// Broadcasts a temperature conversion on the owning master's bus.
pub struct ConvertTCommand {
    master: BusMaster,
    status: Option<ConvertStatus>,
}

impl ConvertTCommand {
    pub(crate) fn new(master: BusMaster) -> Self {
        Self {
            master,
            status: None,
        }
    }

    /// Perform the conversion exactly once.
    pub async fn execute(&mut self) -> &ConvertStatus {
        assert!(
            self.status.is_none(),
            "ConvertTCommand::execute called twice"
        );

        let status = if self.master.is_started() {
            match self.master.transport().convert_t().await {
                Ok(completed_at) => ConvertStatus::Success { completed_at },
                Err(TransportError::NotStarted) => ConvertStatus::BusNotStarted,
                Err(err) => ConvertStatus::CommunicationError {
                    reason: err.to_string(),
                },
            }
        } else {
            ConvertStatus::BusNotStarted
        };

        self.status.insert(status)
    }

    /// Terminal status. Panics if the command has not executed.
    pub fn status(&self) -> &ConvertStatus {
        self.status
            .as_ref()
            .expect("ConvertTCommand status read before execute")
    }

    /// Completion time. Panics on a non-success status.
    pub fn completed_at(&self) -> DateTime<Utc> {
        match self.status() {
            ConvertStatus::Success { completed_at } => *completed_at,
            other => panic!("ConvertTCommand time read on non-success status: {other:?}"),
        }
    }
}

// ── Read scratchpad ─────────────────────────────────────────────────

/// Terminal status of a [`ReadScratchpadCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScratchpadStatus {
    Success(Arc<ScratchpadData>),
    BusNotStarted,
    DeviceNotFound,
    CommunicationError { reason: String },
}

/// Reads scratchpad bytes from one device on the owning master's bus.
pub struct ReadScratchpadCommand {
    master: BusMaster,
    address: DeviceAddress,
    len: usize,
    status: Option<ReadScratchpadStatus>,
}

impl ReadScratchpadCommand {
    pub(crate) fn new(master: BusMaster, address: DeviceAddress, len: usize) -> Self {
        Self {
            master,
            address,
            len,
            status: None,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Perform the read exactly once.
    pub async fn execute(&mut self) -> &ReadScratchpadStatus {
        assert!(
            self.status.is_none(),
            "ReadScratchpadCommand::execute called twice"
        );

        let status = if self.master.is_started() {
            match self
                .master
                .transport()
                .read_scratchpad(&self.address, self.len)
                .await
            {
                Ok(data) => ReadScratchpadStatus::Success(Arc::new(data)),
                Err(TransportError::NotStarted) => ReadScratchpadStatus::BusNotStarted,
                Err(TransportError::DeviceNotFound(_)) => ReadScratchpadStatus::DeviceNotFound,
                Err(err) => ReadScratchpadStatus::CommunicationError {
                    reason: err.to_string(),
                },
            }
        } else {
            ReadScratchpadStatus::BusNotStarted
        };

        self.status.insert(status)
    }

    /// Terminal status. Panics if the command has not executed.
    pub fn status(&self) -> &ReadScratchpadStatus {
        self.status
            .as_ref()
            .expect("ReadScratchpadCommand status read before execute")
    }

    /// Success payload. Panics on a non-success status.
    pub fn data(&self) -> &Arc<ScratchpadData> {
        match self.status() {
            ReadScratchpadStatus::Success(data) => data,
            other => panic!("ReadScratchpadCommand data read on non-success status: {other:?}"),
        }
    }
}

// ── Read power supply ───────────────────────────────────────────────

/// Terminal status of a [`ReadPowerSupplyCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPowerSupplyStatus {
    Success(PowerSupply),
    BusNotStarted,
    DeviceNotFound,
    CommunicationError { reason: String },
}

/// Asks one device how it is powered.
pub struct ReadPowerSupplyCommand {
    master: BusMaster,
    address: DeviceAddress,
    status: Option<ReadPowerSupplyStatus>,
}

impl ReadPowerSupplyCommand {
    pub(crate) fn new(master: BusMaster, address: DeviceAddress) -> Self {
        Self {
            master,
            address,
            status: None,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Perform the read exactly once.
    pub async fn execute(&mut self) -> &ReadPowerSupplyStatus {
        assert!(
            self.status.is_none(),
            "ReadPowerSupplyCommand::execute called twice"
        );

        let status = if self.master.is_started() {
            match self
                .master
                .transport()
                .read_power_supply(&self.address)
                .await
            {
                Ok(power) => ReadPowerSupplyStatus::Success(power),
                Err(TransportError::NotStarted) => ReadPowerSupplyStatus::BusNotStarted,
                Err(TransportError::DeviceNotFound(_)) => ReadPowerSupplyStatus::DeviceNotFound,
                Err(err) => ReadPowerSupplyStatus::CommunicationError {
                    reason: err.to_string(),
                },
            }
        } else {
            ReadPowerSupplyStatus::BusNotStarted
        };

        self.status.insert(status)
    }

    /// Terminal status. Panics if the command has not executed.
    pub fn status(&self) -> &ReadPowerSupplyStatus {
        self.status
            .as_ref()
            .expect("ReadPowerSupplyCommand status read before execute")
    }

    /// Success payload. Panics on a non-success status.
    pub fn power(&self) -> PowerSupply {
        match self.status() {
            ReadPowerSupplyStatus::Success(power) => *power,
            other => panic!("ReadPowerSupplyCommand power read on non-success status: {other:?}"),
        }
    }
}

// ── Start / stop ────────────────────────────────────────────────────

/// Terminal status of a [`StartCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    CommunicationError { reason: String },
}

/// Brings the owning master's transport up.
pub struct StartCommand {
    master: BusMaster,
    status: Option<StartStatus>,
}

impl StartCommand {
    pub(crate) fn new(master: BusMaster) -> Self {
        Self {
            master,
            status: None,
        }
    }

    /// Start the transport exactly once.
    pub async fn execute(&mut self) -> &StartStatus {
        assert!(self.status.is_none(), "StartCommand::execute called twice");

        let status = match self.master.transport().start().await {
            Ok(()) => StartStatus::Started,
            Err(err) => StartStatus::CommunicationError {
                reason: err.to_string(),
            },
        };

        self.status.insert(status)
    }

    /// Terminal status. Panics if the command has not executed.
    pub fn status(&self) -> &StartStatus {
        self.status
            .as_ref()
            .expect("StartCommand status read before execute")
    }
}

/// Terminal status of a [`StopCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopStatus {
    Stopped,
    CommunicationError { reason: String },
}

/// Takes the owning master's transport down, cancelling every notify-search
/// subscription first so no further pushes are queued against a dead bus.
pub struct StopCommand {
    master: BusMaster,
    status: Option<StopStatus>,
}

impl StopCommand {
    pub(crate) fn new(master: BusMaster) -> Self {
        Self {
            master,
            status: None,
        }
    }

    /// Stop the transport exactly once.
    pub async fn execute(&mut self) -> &StopStatus {
        assert!(self.status.is_none(), "StopCommand::execute called twice");

        self.master.cancel_all_notify_search().await;

        let status = match self.master.transport().stop().await {
            // Stopping an already-stopped bus is a no-op.
            Ok(()) | Err(TransportError::NotStarted) => StopStatus::Stopped,
            Err(err) => StopStatus::CommunicationError {
                reason: err.to_string(),
            },
        };

        self.status.insert(status)
    }

    /// Terminal status. Panics if the command has not executed.
    pub fn status(&self) -> &StopStatus {
        self.status
            .as_ref()
            .expect("StopCommand status read before execute")
    }
}
