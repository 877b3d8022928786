// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod collections;
pub mod kds;
pub mod runtime;

pub use self::kds::{
    buffer::ExecBuffer,
    client::SharedClient,
    config::{
        Config,
        Tunables,
    },
    device::{
        CuIndex,
        Device,
    },
    exec::{
        ExecResources,
        XclbinId,
    },
    packet::{
        CommandState,
        Opcode,
    },
    scheduler::Scheduler,
};
pub use self::runtime::fail::Fail;

/// Fails the enclosing test with an [anyhow::Error] when both sides differ.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure failed: {} == {} (left={:?}, right={:?})",
                        stringify!($left),
                        stringify!($right),
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}
