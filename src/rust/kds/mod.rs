// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod buffer;
pub mod client;
pub mod command;
pub mod config;
pub mod cu;
pub mod device;
pub mod diagnostics;
pub mod ert;
pub mod exec;
pub mod packet;
pub mod register;
pub mod scheduler;
