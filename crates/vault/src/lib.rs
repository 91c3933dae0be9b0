//! Credential vault: encrypted-at-rest storage for model-provider API keys
//! and OAuth tokens, plus the device-code flow and transparent refresh used
//! by automated runs.

pub mod cipher;
pub mod device_flow;
pub mod error;
pub mod refresh;
pub mod store;

pub use {
    cipher::{Aes256GcmCipher, Cipher, derive_process_key},
    device_flow::{DeviceFlowBroker, InitiatedFlow, PollOutcome},
    error::VaultError,
    store::{
        CredentialPayload, CredentialStore, CredentialSummary, OAuthEndpoints, RunCredential,
    },
};
