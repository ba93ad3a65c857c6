/// What an update agent should do with a requested check on this poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckGate {
    /// No check requested.
    Idle,
    /// Requested, but the network cannot reach the update server yet.
    Waiting,
    /// Run the check now; the request has been consumed.
    Run,
}

/// A firmware check requested by the controller, held until the network is up.
///
/// The request is only consumed once a poll sees the network up, so a check
/// requested at boot survives the time it takes the station to get an address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCheck {
    requested: bool,
}

impl PendingCheck {
    pub fn request(&mut self) {
        self.requested = true;
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn poll(&mut self, network_up: bool) -> CheckGate {
        match (self.requested, network_up) {
            (false, _) => CheckGate::Idle,
            (true, false) => CheckGate::Waiting,
            (true, true) => {
                self.requested = false;
                CheckGate::Run
            }
        }
    }
}
