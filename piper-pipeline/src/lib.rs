//! Deployment debugging pipeline for a dual arm manipulator
//!
//! Camera frames and joint readings are normalized into policy inputs, the
//! policy's actions are mapped onto clamped joint targets and a bounded
//! [`step_driver::StepDriver`] loop ties the stages together.

pub mod action_mapper;
pub mod deploy_config;
pub mod error;
pub mod frame_sink;
pub mod homing;
pub mod observation;
pub mod policy;
pub mod robot;
pub mod step_driver;
