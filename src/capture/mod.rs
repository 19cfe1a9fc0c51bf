//! Synchronized multi-camera capture.
//!
//! Devices are bound to logical slots by serial number, driven one at a
//! time for every stimulus, and their frames are written into a
//! timestamped session tree alongside a metadata record.

mod device;
mod emulated;
mod ledger;
mod orchestrator;
mod session;

pub use device::{
    CaptureDevice, DeviceArray, DeviceContext, DeviceError, DeviceSettings, GrabFailure,
    GrabResult, RawFrame, SlotMap,
};
pub use emulated::{emulated_devices, EmulatedDevice};
pub use ledger::{FailureRecord, FrameLedger, FrameRecord};
pub use orchestrator::{
    prepare_session, CancelToken, CaptureOrchestrator, CaptureOutcome, CaptureRequest,
    CaptureSummary, LoggingPresenter, PresentError, StimulusPresenter,
};
pub use session::{
    frame_filename, session_timestamp, SessionLayout, SessionMetadata, SESSION_TIMESTAMP_FORMAT,
};
