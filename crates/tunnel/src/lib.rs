//! Tunnel broker: WebSocket session registry, request↔response
//! demultiplexing, and the device-code login used by local agents.

pub mod broker;
pub mod device_login;
pub mod forward;
pub mod session;

pub use {
    broker::{TunnelCallbacks, handle_connection},
    device_login::{
        DeviceCodeStore, DeviceLoginBroker, DeviceSession, DeviceSessionStatus,
        MemoryDeviceCodeStore, SqliteDeviceCodeStore,
    },
    forward::{ForwardError, ForwardedResponse, forward_request, parse_host},
    session::{TunnelHandle, TunnelSessions},
};
