use std::io;

use thiserror::Error;

use crate::{attach::AttachMode, lifecycle::LifecycleState};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures while loading, attaching or releasing the XDP program.
#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("network interface `{iface}` not found")]
    InterfaceNotFound {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to load XDP program")]
    Load(#[source] BoxError),

    #[error("failed to attach XDP program to `{iface}` (index {if_index}) in {mode} mode")]
    Attach {
        iface: String,
        if_index: u32,
        mode: AttachMode,
        #[source]
        source: BoxError,
    },

    #[error("failed to detach XDP program from `{iface}` (index {if_index})")]
    Detach {
        iface: String,
        if_index: u32,
        #[source]
        source: BoxError,
    },

    #[error("failed to open event channel `{map}`")]
    Channel {
        map: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("failed to unload XDP program")]
    Unload(#[source] BoxError),

    #[error("cannot start from the {0:?} state")]
    InvalidState(LifecycleState),
}

/// Runtime failure of the event channel's consumer side.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("event channel fault")]
    Fault(#[source] io::Error),
}
