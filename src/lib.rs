//! caliserv — job dispatch and supervision service for the calibro
//! model-calibration platform.
//!
//! The core is the reconciliation-and-supervision loop: a [`dispatcher`]
//! ticks the database, a [`reconcile`]r drives each row's lifecycle against
//! a [`registry`] of locally supervised [`worker`] processes, which stage
//! inputs via the [`stager`], invoke the (external) calibration binary, and
//! report back over the [`channel`].

pub mod channel;
pub mod db;
pub mod dispatcher;
pub mod errlog;
pub mod errorart;
pub mod fsutil;
pub mod model;
pub mod paths;
pub mod proctitle;
pub mod reconcile;
pub mod registry;
pub mod stager;
pub mod timeutil;
pub mod worker;
