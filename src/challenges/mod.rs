// Aggregates challenge detection, solving, and browser header layers used to pass proof-of-work interstitials.

pub mod core;
pub mod detectors;
pub mod solvers;
pub mod user_agents;
