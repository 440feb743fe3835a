//! Loading the XDP classifier and binding it to one interface.

use std::{ffi::CString, fmt, io};

use aya::{
    maps::RingBuf,
    programs::{xdp::XdpLinkId, Xdp, XdpFlags},
    Ebpf,
};
use aya_log::EbpfLogger;
use tracing::{debug, info, warn};

use crate::{
    consumer::{EventChannel, RingBufChannel},
    error::{BoxError, DatapathError},
};

/// Name of the `#[xdp]` function in the eBPF object.
const PROGRAM_NAME: &str = "pingwall";

/// Name of the ring buffer map the classifier submits events to.
const EVENTS_MAP: &str = "EVENTS";

/// Where in the receive path the classifier runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AttachMode {
    /// Native XDP, inside the driver's receive path.
    #[default]
    FastPath,
    /// Generic (SKB) XDP, works with any driver but runs later.
    Fallback,
}

impl AttachMode {
    pub fn flags(self) -> XdpFlags {
        match self {
            AttachMode::FastPath => XdpFlags::DRV_MODE,
            AttachMode::Fallback => XdpFlags::SKB_MODE,
        }
    }
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttachMode::FastPath => "driver",
            AttachMode::Fallback => "generic",
        })
    }
}

/// The interface and mode a program is (to be) attached with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub iface: String,
    pub if_index: u32,
    pub mode: AttachMode,
}

impl Attachment {
    /// Looks `iface` up by name. Unknown interfaces are an error here, before
    /// anything has been loaded into the kernel.
    pub fn resolve(iface: &str, mode: AttachMode) -> Result<Self, DatapathError> {
        let not_found = |source: io::Error| DatapathError::InterfaceNotFound {
            iface: iface.to_owned(),
            source,
        };
        let name = CString::new(iface)
            .map_err(|e| not_found(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        // SAFETY: `name` is a valid NUL-terminated string for the duration
        // of the call.
        let if_index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if if_index == 0 {
            return Err(not_found(io::Error::last_os_error()));
        }

        Ok(Self {
            iface: iface.to_owned(),
            if_index,
            mode,
        })
    }
}

/// Produces a loaded, verified, not yet attached program.
pub trait Loader {
    type Program: LoadedProgram;

    fn load(&mut self) -> Result<Self::Program, DatapathError>;
}

/// Handle to a classifier living in the kernel.
pub trait LoadedProgram {
    type Channel: EventChannel;

    fn attach(&mut self, attachment: &Attachment) -> Result<(), DatapathError>;

    /// Reverts the current attachment. Returns `Ok(false)` without doing
    /// anything if the program is not attached.
    fn detach(&mut self) -> Result<bool, DatapathError>;

    fn open_channel(&mut self) -> Result<Self::Channel, DatapathError>;

    /// Unloads the program and releases every kernel object it owns.
    fn destroy(self) -> Result<(), DatapathError>;
}

/// Loads the classifier from an embedded eBPF object.
pub struct XdpLoader {
    object: &'static [u8],
}

impl XdpLoader {
    pub fn new(object: &'static [u8]) -> Self {
        Self { object }
    }
}

impl Loader for XdpLoader {
    type Program = XdpProgram;

    fn load(&mut self) -> Result<XdpProgram, DatapathError> {
        raise_memlock_limit();

        let mut ebpf = Ebpf::load(self.object).map_err(|e| DatapathError::Load(e.into()))?;
        if let Err(e) = EbpfLogger::init(&mut ebpf) {
            warn!(error = ?e, "failed to initialize eBPF logger");
        }

        xdp_mut(&mut ebpf)
            .and_then(|program| program.load().map_err(Into::into))
            .map_err(DatapathError::Load)?;
        debug!(program = PROGRAM_NAME, "XDP program loaded");

        Ok(XdpProgram { ebpf, link: None })
    }
}

/// A loaded XDP program and, while attached, its link.
pub struct XdpProgram {
    ebpf: Ebpf,
    link: Option<(Attachment, XdpLinkId)>,
}

impl LoadedProgram for XdpProgram {
    type Channel = RingBufChannel;

    fn attach(&mut self, attachment: &Attachment) -> Result<(), DatapathError> {
        let attach_error = |source: BoxError| DatapathError::Attach {
            iface: attachment.iface.clone(),
            if_index: attachment.if_index,
            mode: attachment.mode,
            source,
        };
        let program = xdp_mut(&mut self.ebpf).map_err(attach_error)?;
        let link = program
            .attach_to_if_index(attachment.if_index, attachment.mode.flags())
            .map_err(|e| attach_error(e.into()))?;

        self.link = Some((attachment.clone(), link));
        Ok(())
    }

    fn detach(&mut self) -> Result<bool, DatapathError> {
        let Some((attachment, link)) = self.link.take() else {
            return Ok(false);
        };
        xdp_mut(&mut self.ebpf)
            .and_then(|program| program.detach(link).map_err(Into::into))
            .map_err(|source| DatapathError::Detach {
                iface: attachment.iface,
                if_index: attachment.if_index,
                source,
            })?;
        Ok(true)
    }

    fn open_channel(&mut self) -> Result<RingBufChannel, DatapathError> {
        let channel_error = |source: BoxError| DatapathError::Channel {
            map: EVENTS_MAP,
            source,
        };
        let map = self
            .ebpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| channel_error(format!("map `{EVENTS_MAP}` not found").into()))?;
        let ring = RingBuf::try_from(map).map_err(|e| channel_error(e.into()))?;

        RingBufChannel::new(ring).map_err(|e| channel_error(e.into()))
    }

    fn destroy(mut self) -> Result<(), DatapathError> {
        // Unloading also drops any link `detach` did not get to.
        xdp_mut(&mut self.ebpf)
            .and_then(|program| program.unload().map_err(Into::into))
            .map_err(DatapathError::Unload)?;
        info!(program = PROGRAM_NAME, "XDP program unloaded");
        Ok(())
    }
}

fn xdp_mut(ebpf: &mut Ebpf) -> Result<&mut Xdp, BoxError> {
    let program = ebpf
        .program_mut(PROGRAM_NAME)
        .ok_or_else(|| format!("program `{PROGRAM_NAME}` not found in eBPF object"))?;
    Ok(program.try_into()?)
}

/// Lifts RLIMIT_MEMLOCK so map and program allocations are not refused on
/// kernels that still charge BPF memory against it.
fn raise_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: `rlim` is a fully initialised rlimit that outlives the call.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!(
            error = %io::Error::last_os_error(),
            "failed to remove limit on locked memory"
        );
    }
}
