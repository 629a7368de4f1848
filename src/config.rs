use std::time::Duration;

/// Runtime configuration for the whole server suite. All servers share one
///  instance; the CLI overrides the ports.
#[derive(Debug)]
pub struct Config {
    pub lrcp_port: u16,
    pub speed_port: u16,
    pub isl_port: u16,
    pub job_port: u16,

    /// hard bound on the wire size of a single LRCP message, in either direction
    pub max_datagram_size: usize,
    /// how long to wait for an ack before retransmitting pending data
    pub retransmit_interval: Duration,
    /// a session with unacknowledged data older than this is given up on
    pub session_expiry: Duration,
    pub session_channel_capacity: usize,

    /// capacity of the speed daemon's central command queue
    pub dispatcher_channel_capacity: usize,
    /// capacity of each connection's outbound message queue
    pub outbound_channel_capacity: usize,
}

impl Config {
    pub fn new() -> Config {
        Config {
            lrcp_port: 5007,
            speed_port: 5006,
            isl_port: 5008,
            job_port: 5009,
            max_datagram_size: 1000,
            retransmit_interval: Duration::from_millis(100),
            session_expiry: Duration::from_secs(60),
            session_channel_capacity: 32,
            dispatcher_channel_capacity: 256,
            outbound_channel_capacity: 32,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
