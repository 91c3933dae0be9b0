//! Tunnel wire protocol and control-plane token definitions.
//!
//! The tunnel speaks JSON frames over a WebSocket. Frame types:
//! - `auth`               — agent → broker, carries the tunnel JWT
//! - `open`               — agent → broker, port announcement
//! - `ping` / `pong`      — liveness in both directions
//! - `request`/`response` — one forwarded HTTP exchange, correlated by `id`
//! - `data`               — body chunk for either direction, `final` on last
//! - `close`              — cancel the in-flight exchange for an `id`
//! - `error`              — non-fatal condition report
//!
//! Unknown frame types are dropped without closing the connection.

pub mod events;
pub mod frames;
pub mod tokens;

pub use {
    events::{ControlEvent, RunStatusEvent, WorkspaceStatusEvent},
    frames::{ExposedPort, TunnelFrame},
    tokens::{AgentClaims, TokenKeys, TunnelClaims, WorkspaceClaims, scopes},
};

// ── Constants ────────────────────────────────────────────────────────────────

/// Broker → agent keepalive interval.
pub const PING_INTERVAL_MS: u64 = 3_000;
/// Missed-pong deadline; past this the broker terminates the connection.
pub const PONG_DEADLINE_MS: u64 = 15_000;
/// How long the broker waits for the `auth` frame before giving up.
pub const AUTH_TIMEOUT_MS: u64 = 10_000;
/// Upper bound on a single frame's JSON encoding.
pub const MAX_FRAME_BYTES: usize = 1_048_576; // 1 MB
/// Body chunk size for `data` frames (pre-base64).
pub const DATA_CHUNK_BYTES: usize = 65_536; // 64 KB

/// Tunnel JWT lifetime (minted per connection attempt).
pub const TUNNEL_TOKEN_TTL_SECS: i64 = 10 * 60;
/// Workspace JWT lifetime (injected into the workspace environment).
pub const WORKSPACE_TOKEN_TTL_SECS: i64 = 60 * 60;
/// Agent token lifetime (obtained via device-code login).
pub const AGENT_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Device-code session lifetime.
pub const DEVICE_CODE_TTL_SECS: i64 = 10 * 60;
/// Minimum interval between device-login polls.
pub const DEVICE_POLL_MIN_SECS: u64 = 5;

/// A run is considered stalled once `now − started_at` exceeds this.
pub const RUN_STALL_MINUTES: i64 = 40;
