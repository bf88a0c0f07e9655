#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![allow(renamed_and_removed_lints)]
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)]
#![allow(clippy::needless_lifetimes)]

pub mod caps;
mod config;
mod env;
mod err;
mod job;
mod queue;
mod runtime;
mod shutdown;
mod startup;

pub use config::{
    ConfigBuildError, ControlListener, RestartPolicy, TorDaemonConfig, TorDaemonConfigBuilder,
};
pub use env::{DaemonEnv, Fid};
pub use err::{Error, ErrorKind, HasKind, ProcessStartError, Result};
pub use job::{
    ActionKind, FailureCallback, JobArgument, JobCallbacks, JobHandle, JobOutput, JobResult,
    JobState, SuccessCallback,
};
pub use runtime::{DaemonState, DaemonStatus, NetworkState, StatusEvents, TorRuntime};

// The lower layers are part of this crate's API surface.
pub use tor_ctrl;
pub use tor_torrc;
