use std::net::SocketAddr;

/// Operator-visible happenings, drained from the tick loop into log lines.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnecting {
        client: usize,
        addr: SocketAddr,
    },
    ClientEntered {
        client: usize,
        name: String,
    },
    ClientDisconnected {
        client: usize,
        kind: DisconnectReason,
        detail: String,
    },
    WorldReinit {
        at_tick: i32,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Shutdown => "server shutdown",
        }
    }
}
