#![warn(clippy::all, clippy::pedantic)]

//! Vision-model browser navigation.
//!
//! A navigation loops over observe → decide → act: capture the page
//! ([`browser::observation`]), ask a vision model for one action
//! ([`providers`]), run it ([`browser::executor`]) and report the step
//! ([`emitter`]) until the model is done or a bound is hit. The loop itself
//! lives in [`agent::Orchestrator`]; [`agent::NavigationService`] runs many
//! of them, one per browser target.

pub mod actions;
pub mod agent;
pub mod browser;
pub mod config;
pub mod emitter;
pub mod providers;
pub(crate) mod util;

pub use actions::Action;
pub use config::Config;
