//! Radarr/Sonarr API client.

pub mod client;
pub mod models;

pub use client::ArrClient;
pub use models::{SeasonInventory, WantedEpisode, WantedKind, WantedMovie};
