//! Thread scheduling control for platforms without real-time scheduling
//! support. Everything is a no-op or an error.
use std::fmt;

#[derive(Debug, Clone, Copy)]
pub struct Unsupported;

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("not supported on this platform")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedParams;

pub fn is_privileged() -> bool {
    false
}

pub fn priority_range() -> Result<(i32, i32), Unsupported> {
    Err(Unsupported)
}

pub fn current() -> Result<SchedParams, Unsupported> {
    Err(Unsupported)
}

pub fn set_current_fifo(_priority: i32) -> Result<(), Unsupported> {
    Err(Unsupported)
}

pub fn restore(_params: SchedParams) -> Result<(), Unsupported> {
    Err(Unsupported)
}

pub fn pin_current_to(_cpu: usize) -> Result<(), Unsupported> {
    Err(Unsupported)
}
