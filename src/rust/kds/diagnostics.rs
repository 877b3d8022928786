// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::kds::exec::ExecMode;
use ::std::fmt;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Usage counters of one CU.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CuDiagnostics {
    pub base_addr: u32,
    /// Number of commands started on the CU since the last reset.
    pub usage: u32,
    /// Last known control register value.
    pub status: u32,
}

/// Counters reported by the embedded scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErtDiagnostics {
    pub version: u32,
    /// Commands written to each slot since configuration.
    pub slot_usage: Vec<u32>,
    /// Whether the host currently tracks a command in each slot.
    pub slot_busy: Vec<bool>,
    /// Slot status as last reported by the embedded scheduler.
    pub slot_status: Vec<u32>,
    pub cu_state: Vec<u32>,
}

/// Read-only snapshot of an execution core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostics {
    pub mode: ExecMode,
    pub configured: bool,
    pub stopped: bool,
    pub flush: bool,
    pub polling: bool,
    pub num_cdma: usize,
    pub num_slots: usize,
    pub cus: Vec<CuDiagnostics>,
    pub num_pending: usize,
    pub num_running: usize,
    pub outstanding: usize,
    pub total: u64,
    pub ert: Option<ErtDiagnostics>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Diagnostics {
    pub fn num_cus(&self) -> usize {
        self.cus.len()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Writes `values` as `{a,b,c}`.
fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, values: &[T]) -> fmt::Result {
    write!(f, "{{")?;
    for (ix, value) in values.iter().enumerate() {
        if ix > 0 {
            write!(f, ",")?;
        }
        write!(f, "{}", value)?;
    }
    write!(f, "}}")
}

/// Writes per-slot values as `{-,a,b}`. Slot 0 belongs to control commands and is not shown.
fn write_slot_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, values: &[T]) -> fmt::Result {
    write!(f, "{{")?;
    for (ix, value) in values.iter().enumerate() {
        if ix == 0 {
            write!(f, "-")?;
        } else {
            write!(f, ",{}", value)?;
        }
    }
    write!(f, "}}")
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for cu in self.cus.iter() {
            writeln!(f, "CU[@{:#x}] : {} status : {}", cu.base_addr, cu.usage, cu.status)?;
        }
        writeln!(f, "KDS number of pending commands: {}", self.num_pending)?;

        let ert: &ErtDiagnostics = match self.ert.as_ref() {
            Some(ert) => ert,
            None => return writeln!(f, "KDS number of running commands: {}", self.num_running),
        };

        write!(f, "CQ usage : ")?;
        write_list(f, &ert.slot_usage)?;
        writeln!(f)?;

        write!(f, "CQ mirror state : ")?;
        let busy: Vec<u8> = ert.slot_busy.iter().map(|b| *b as u8).collect();
        write_slot_list(f, &busy)?;
        writeln!(f)?;

        writeln!(f, "ERT scheduler version : {:#x}", ert.version)?;
        writeln!(f, "ERT number of submitted commands: {}", self.num_running)?;

        write!(f, "ERT scheduler CU state : ")?;
        write_list(f, &ert.cu_state)?;
        writeln!(f)?;

        write!(f, "ERT scheduler CQ state : ")?;
        write_slot_list(f, &ert.slot_status)?;
        writeln!(f)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ::anyhow::Result;

    fn snapshot(ert: Option<ErtDiagnostics>) -> Diagnostics {
        Diagnostics {
            mode: ExecMode::HostScheduled,
            configured: true,
            stopped: false,
            flush: false,
            polling: true,
            num_cdma: 0,
            num_slots: 0,
            cus: vec![
                CuDiagnostics {
                    base_addr: 0x1800000,
                    usage: 3,
                    status: 4,
                },
                CuDiagnostics {
                    base_addr: 0x1810000,
                    usage: 0,
                    status: 0,
                },
            ],
            num_pending: 1,
            num_running: 2,
            outstanding: 3,
            total: 9,
            ert,
        }
    }

    #[test]
    fn host_scheduled_report() -> Result<()> {
        let text: String = snapshot(None).to_string();
        crate::ensure_eq!(
            text,
            "CU[@0x1800000] : 3 status : 4\n\
             CU[@0x1810000] : 0 status : 0\n\
             KDS number of pending commands: 1\n\
             KDS number of running commands: 2\n"
                .to_string()
        );
        Ok(())
    }

    #[test]
    fn embedded_scheduler_report() -> Result<()> {
        let text: String = snapshot(Some(ErtDiagnostics {
            version: 0xbeef,
            slot_usage: vec![1, 5, 0],
            slot_busy: vec![false, true, false],
            slot_status: vec![0, 1, 0],
            cu_state: vec![1, 0],
        }))
        .to_string();
        let lines: Vec<&str> = text.lines().collect();
        crate::ensure_eq!(lines[3], "CQ usage : {1,5,0}");
        crate::ensure_eq!(lines[4], "CQ mirror state : {-,1,0}");
        crate::ensure_eq!(lines[5], "ERT scheduler version : 0xbeef");
        crate::ensure_eq!(lines[6], "ERT number of submitted commands: 2");
        crate::ensure_eq!(lines[7], "ERT scheduler CU state : {1,0}");
        crate::ensure_eq!(lines[8], "ERT scheduler CQ state : {-,1,0}");
        Ok(())
    }
}
