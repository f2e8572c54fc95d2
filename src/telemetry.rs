use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

pub const TELEMETRY_TARGET: &str = "video_hw_decode::telemetry";

static INIT_REPORTED: AtomicBool = AtomicBool::new(false);
static ERROR_REPORTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderEvent {
    Init,
    Error,
}

impl fmt::Display for DecoderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Error => f.write_str("error"),
        }
    }
}

fn flag(event: DecoderEvent) -> &'static AtomicBool {
    match event {
        DecoderEvent::Init => &INIT_REPORTED,
        DecoderEvent::Error => &ERROR_REPORTED,
    }
}

pub fn report(event: DecoderEvent) -> bool {
    if flag(event).swap(true, Ordering::AcqRel) {
        return false;
    }
    tracing::info!(target: TELEMETRY_TARGET, event = %event, "decoder event");
    true
}

pub fn report_init() -> bool {
    report(DecoderEvent::Init)
}

pub fn report_error() -> bool {
    report(DecoderEvent::Error)
}

pub fn has_reported(event: DecoderEvent) -> bool {
    flag(event).load(Ordering::Acquire)
}
