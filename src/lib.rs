//! Mirror a remote directory into a local one.
//!
//! The [`controller::Controller`] reconciles remote and local listings,
//! rsync progress, extraction progress and the persisted tracking sets
//! into a [`model::Model`] of root-level files. Callers observe and steer
//! it through a [`controller::ControllerHandle`].

pub mod controller;
pub mod model;
pub mod storage;
pub mod utils;
